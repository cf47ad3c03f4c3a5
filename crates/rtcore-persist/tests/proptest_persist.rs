//! Property tests for resource paths and the catalog.

use proptest::prelude::*;
use rtcore_persist::{Catalog, Mutation, ResourceId, ResourcePath};

fn component() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,8}"
}

fn concrete_path() -> impl Strategy<Value = ResourcePath> {
    (
        prop::option::of("[a-z]{1,6}"),
        prop::collection::vec(component(), 0..5),
    )
        .prop_map(|(context, components)| ResourcePath::new(context.as_deref(), components).unwrap())
}

proptest! {
    #[test]
    fn display_then_parse_is_identity(path in concrete_path()) {
        prop_assert_eq!(ResourcePath::parse(&path.to_string()).unwrap(), path);
    }

    #[test]
    fn concrete_paths_match_only_equals(a in concrete_path(), b in concrete_path()) {
        prop_assert_eq!(a.matches(&b), a == b);
        prop_assert!(a.matches(&a));
    }

    #[test]
    fn wildcard_last_component_matches_siblings(path in concrete_path(), name in component()) {
        prop_assume!(!path.is_root());
        let wildcard = path.parent().append("*").unwrap();
        let sibling = path.parent().append(&name).unwrap();
        prop_assert!(wildcard.matches(&path));
        prop_assert!(wildcard.matches(&sibling));
        prop_assert!(!wildcard.matches(&path.parent()));
    }

    #[test]
    fn recursive_wildcard_matches_descendants(
        path in concrete_path(),
        extra in prop::collection::vec(component(), 0..4),
    ) {
        let recursive = path.append("**").unwrap();
        let descendant = extra.iter().fold(path.clone(), |p, c| p.append(c).unwrap());
        prop_assert!(recursive.matches(&descendant));
    }

    #[test]
    fn parse_never_panics(input in "\\PC{0,40}") {
        let _ = ResourcePath::parse(&input);
    }

    #[test]
    fn catalog_listing_agrees_with_matches(
        paths in prop::collection::btree_set(concrete_path(), 1..12),
        query in concrete_path(),
    ) {
        let mut catalog = Catalog::new();
        for path in &paths {
            let id = ResourceId::new_random();
            catalog.apply(&Mutation::CreateResource { id });
            catalog.apply(&Mutation::LinkPath { path: path.clone(), id });
        }
        let query = query.append("**").unwrap();
        let listed: Vec<ResourcePath> = catalog.list(&query).into_iter().map(|l| l.path).collect();
        let expected: Vec<ResourcePath> = paths.iter().filter(|p| query.matches(p)).cloned().collect();
        prop_assert_eq!(listed, expected);
    }
}
