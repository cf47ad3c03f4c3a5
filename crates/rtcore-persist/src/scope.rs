//! Transaction scopes: the paths and resources a transaction may touch.

use crate::lock_master::LockKey;
use crate::types::{ResourceId, ResourcePath};

/// Set of paths and resource ids locked by one transaction.
///
/// Paths may be wildcards; a scope path covers every path it matches.
/// A resource is covered when named explicitly or linked at a covered path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnScope {
    paths: Vec<ResourcePath>,
    resources: Vec<ResourceId>,
    all: bool,
}

impl TxnScope {
    /// Empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope covering the entire store.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Adds a path.
    pub fn with_path(mut self, path: ResourcePath) -> Self {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
        self
    }

    /// Adds several paths.
    pub fn with_paths(self, paths: impl IntoIterator<Item = ResourcePath>) -> Self {
        paths.into_iter().fold(self, Self::with_path)
    }

    /// Adds a resource id.
    pub fn with_resource(mut self, id: ResourceId) -> Self {
        if !self.resources.contains(&id) {
            self.resources.push(id);
        }
        self
    }

    /// True for a whole-store scope.
    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Declared paths.
    pub fn paths(&self) -> &[ResourcePath] {
        &self.paths
    }

    /// Declared resource ids.
    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    /// True if `path` is matched by a declared path.
    pub fn covers_path(&self, path: &ResourcePath) -> bool {
        self.all || self.paths.iter().any(|p| p.matches(path))
    }

    /// True if `id` was declared explicitly.
    pub fn names_resource(&self, id: ResourceId) -> bool {
        self.all || self.resources.contains(&id)
    }

    pub(crate) fn lock_keys(&self) -> Vec<LockKey> {
        self.paths
            .iter()
            .cloned()
            .map(LockKey::Path)
            .chain(self.resources.iter().copied().map(LockKey::Resource))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_wildcard() {
        let scope = TxnScope::new().with_path(ResourcePath::parse("/a/*").unwrap());
        assert!(scope.covers_path(&ResourcePath::parse("/a/b").unwrap()));
        assert!(!scope.covers_path(&ResourcePath::parse("/b/a").unwrap()));
    }

    #[test]
    fn test_all_covers_everything() {
        let scope = TxnScope::all();
        assert!(scope.covers_path(&ResourcePath::parse("/x/y/z").unwrap()));
        assert!(scope.names_resource(ResourceId::new_random()));
        assert!(scope.lock_keys().is_empty());
    }

    #[test]
    fn test_dedups_entries() {
        let id = ResourceId::new_random();
        let path = ResourcePath::parse("/a").unwrap();
        let scope = TxnScope::new()
            .with_resource(id)
            .with_resource(id)
            .with_paths([path.clone(), path]);
        assert_eq!(scope.resources().len(), 1);
        assert_eq!(scope.paths().len(), 1);
        assert_eq!(scope.lock_keys().len(), 2);
    }
}
