//! Resource addressing: ids, hierarchical paths and task ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PersistError, PersistResult};

/// Matches any single component, or any context.
pub const WILDCARD: &str = "*";

/// Matches any number of trailing components. Only valid as the last component.
pub const WILDCARD_RECURSIVE: &str = "**";

/// Separates the context from the components in textual form.
pub const CONTEXT_SEPARATOR: &str = "://";

/// Separates path components.
pub const PATH_SEPARATOR: char = '/';

/// Unique id of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Creates a random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Hierarchical resource name, `context://a/b/c` or `/a/b/c`.
///
/// Equality and ordering are exact; [`ResourcePath::matches`] is the
/// wildcard-aware comparison used for listing and lock conflicts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath {
    context: Option<String>,
    components: Vec<String>,
}

impl ResourcePath {
    /// Builds a path from an optional context and components, validating wildcards.
    pub fn new<I, S>(context: Option<&str>, components: I) -> PersistResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let context = context
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        let path = Self {
            context,
            components,
        };
        path.validate()?;
        Ok(path)
    }

    /// Builds a context-less path from components.
    pub fn from_components<I, S>(components: I) -> PersistResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(None, components)
    }

    fn validate(&self) -> PersistResult<()> {
        let invalid = |reason: &str| PersistError::InvalidPath {
            path: self.to_string(),
            reason: reason.to_string(),
        };

        if self.context.as_deref() == Some(WILDCARD_RECURSIVE) {
            return Err(invalid("context cannot be a recursive wildcard"));
        }
        if let Some(pos) = self.components.iter().position(|c| c == WILDCARD_RECURSIVE) {
            if pos + 1 != self.components.len() {
                return Err(invalid("recursive wildcard must be the last component"));
            }
        }
        for component in &self.components {
            if component.is_empty() || component.chars().any(char::is_control) {
                return Err(invalid("components must be non-empty printable text"));
            }
            if component.contains(PATH_SEPARATOR) {
                return Err(invalid("components cannot contain a separator"));
            }
        }
        Ok(())
    }

    /// Parses `context://a/b` or `a/b`; blank components are dropped.
    pub fn parse(input: &str) -> PersistResult<Self> {
        let split = |s: &str| -> Vec<String> {
            s.split(PATH_SEPARATOR)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        };

        match input.split_once(CONTEXT_SEPARATOR) {
            None => Self::new(None, split(input)),
            Some((context, rest)) => {
                if rest.contains(CONTEXT_SEPARATOR) || context.trim().is_empty() {
                    return Err(PersistError::InvalidPath {
                        path: input.to_string(),
                        reason: "expected exactly one context".to_string(),
                    });
                }
                Self::new(Some(context), split(rest))
            }
        }
    }

    /// Context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Components in order.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// True for the root path of its context.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// True if the context or any component is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.context.as_deref() == Some(WILDCARD)
            || self
                .components
                .iter()
                .any(|c| c == WILDCARD || c == WILDCARD_RECURSIVE)
    }

    /// True if the last component is `**`.
    pub fn is_wildcard_recursive(&self) -> bool {
        self.components.last().map(String::as_str) == Some(WILDCARD_RECURSIVE)
    }

    /// True if the last component is `*` or `**`.
    pub fn is_wildcard_terminated(&self) -> bool {
        matches!(
            self.components.last().map(String::as_str),
            Some(WILDCARD) | Some(WILDCARD_RECURSIVE)
        )
    }

    /// Parent path; the root is its own parent.
    pub fn parent(&self) -> Self {
        let mut components = self.components.clone();
        components.pop();
        Self {
            context: self.context.clone(),
            components,
        }
    }

    /// This path with one more component.
    pub fn append(&self, component: &str) -> PersistResult<Self> {
        let mut components = self.components.clone();
        components.push(component.to_string());
        Self::new(self.context.as_deref(), components)
    }

    /// Replaces a trailing wildcard with a fresh UUID component.
    ///
    /// Paths that do not end in a wildcard are returned unchanged.
    pub fn append_uuid_if_wildcard(&self) -> Self {
        if !self.is_wildcard_terminated() {
            return self.clone();
        }
        let mut components = self.components.clone();
        components.pop();
        components.push(Uuid::new_v4().to_string());
        Self {
            context: self.context.clone(),
            components,
        }
    }

    /// Binds a context-less path to `context`.
    pub fn with_context_if_absent(&self, context: &str) -> Self {
        match self.context {
            Some(_) => self.clone(),
            None => Self {
                context: Some(context.to_string()),
                components: self.components.clone(),
            },
        }
    }

    /// Wildcard-aware match.
    ///
    /// Contexts match when equal or either is `*`. Components match pairwise
    /// when equal or either is `*`. Without `**` both paths must have the same
    /// length; `**` matches its prefix followed by any number of components.
    pub fn matches(&self, other: &ResourcePath) -> bool {
        fn component_matches(l: &str, r: &str) -> bool {
            l == WILDCARD || r == WILDCARD || l == r
        }

        let contexts_match = match (self.context(), other.context()) {
            (Some(l), Some(r)) => component_matches(l, r),
            (None, None) => true,
            (Some(c), None) | (None, Some(c)) => c == WILDCARD,
        };
        if !contexts_match {
            return false;
        }

        let lhs_recursive = self.is_wildcard_recursive();
        let rhs_recursive = other.is_wildcard_recursive();
        let lhs_limit = self.components.len() - usize::from(lhs_recursive);
        let rhs_limit = other.components.len() - usize::from(rhs_recursive);

        let length_ok = match (lhs_recursive, rhs_recursive) {
            (false, false) => lhs_limit == rhs_limit,
            (true, false) => rhs_limit >= lhs_limit,
            (false, true) => lhs_limit >= rhs_limit,
            (true, true) => true,
        };

        length_ok
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .take(lhs_limit.min(rhs_limit))
                .all(|(l, r)| component_matches(l, r))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{context}{CONTEXT_SEPARATOR}")?;
        } else {
            write!(f, "{PATH_SEPARATOR}")?;
        }
        write!(f, "{}", self.components.join("/"))
    }
}

impl FromStr for ResourcePath {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A pending task recorded against a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Resource the task belongs to.
    pub resource_id: ResourceId,
    /// Task number, unique per resource.
    pub task: u64,
}

impl TaskId {
    /// Creates a task id.
    pub fn new(resource_id: ResourceId, task: u64) -> Self {
        Self { resource_id, task }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource_id, self.task)
    }
}

/// One result of a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Linked path.
    pub path: ResourcePath,
    /// Resource the path points at.
    pub resource_id: ResourceId,
}

/// Outcome of unlinking a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unlinked {
    /// Resource the path pointed at.
    pub resource_id: ResourceId,
    /// True if this was the last path and the resource was removed.
    pub removed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_without_context() {
        let path = p("/a/ b //c/");
        assert_eq!(path.context(), None);
        assert_eq!(path.components(), ["a", "b", "c"]);
        assert_eq!(path.to_string(), "/a/b/c");
    }

    #[test]
    fn test_parse_with_context() {
        let path = p("node-1://users/42");
        assert_eq!(path.context(), Some("node-1"));
        assert_eq!(path.components(), ["users", "42"]);
        assert_eq!(path.to_string(), "node-1://users/42");
        assert_eq!(p(&path.to_string()), path);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ResourcePath::parse("a://b://c").is_err());
        assert!(ResourcePath::parse("a/**/b").is_err());
        assert!(ResourcePath::parse("**://a").is_err());
        assert!(ResourcePath::parse("a/b/**").is_ok());
    }

    #[test]
    fn test_matches_single_wildcard() {
        assert!(p("/a/*").matches(&p("/a/b")));
        assert!(p("/a/b").matches(&p("/a/*")));
        assert!(!p("/a/*").matches(&p("/a/b/c")));
        assert!(!p("/a/*").matches(&p("/x/b")));
        assert!(p("/*/b").matches(&p("/a/b")));
    }

    #[test]
    fn test_matches_recursive_wildcard() {
        assert!(p("/a/**").matches(&p("/a/b/c")));
        assert!(p("/a/**").matches(&p("/a")));
        assert!(p("/a/b/c").matches(&p("/a/**")));
        assert!(!p("/a/**").matches(&p("/b/c")));
        assert!(p("/**").matches(&p("/anything/at/all")));
    }

    #[test]
    fn test_matches_context() {
        assert!(p("*://a").matches(&p("n1://a")));
        assert!(!p("n2://a").matches(&p("n1://a")));
        assert!(!p("n1://a").matches(&p("/a")));
        assert!(p("/a").matches(&p("/a")));
    }

    #[test]
    fn test_exact_paths_match_only_themselves() {
        assert!(!p("/a/b").matches(&p("/a/b/c")));
        assert!(!p("/a/b/c").matches(&p("/a/b")));
    }

    #[test]
    fn test_append_uuid_if_wildcard() {
        let expanded = p("/players/*").append_uuid_if_wildcard();
        assert!(!expanded.is_wildcard());
        assert_eq!(expanded.components().len(), 2);
        assert!(expanded.components()[1].parse::<Uuid>().is_ok());

        let plain = p("/players/1");
        assert_eq!(plain.append_uuid_if_wildcard(), plain);
    }

    #[test]
    fn test_with_context_if_absent() {
        assert_eq!(p("/a").with_context_if_absent("n1"), p("n1://a"));
        assert_eq!(p("n2://a").with_context_if_absent("n1"), p("n2://a"));
    }

    #[test]
    fn test_parent_and_append() {
        let path = p("/a/b");
        assert_eq!(path.parent(), p("/a"));
        assert_eq!(path.parent().append("c").unwrap(), p("/a/c"));
        assert!(p("/").is_root());
        assert!(path.append("x/y").is_err());
    }

    #[test]
    fn test_resource_id_text() {
        let id = ResourceId::new_random();
        assert_eq!(id.to_string().parse::<ResourceId>().unwrap(), id);
    }
}
