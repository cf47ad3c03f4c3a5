//! Resource lifecycle over the persistence environment.
//!
//! A resource is resident while at least one holder has acquired it. The
//! last [`ResourceService::release`] serializes it, writes it back when its
//! bytes changed, and evicts it.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rtcore_persist::{
    Listing, PersistenceEnvironment, ResourceId, ResourcePath, TaskId, TxnScope, Unlinked,
};
use tracing::{debug, info, trace};

use crate::error::{ResourceError, ResourceResult};
use crate::lock::LockMap;
use crate::resource::Resource;

/// Lifecycle operations on resources of type `R`.
pub trait ResourceService<R: Resource>: Send + Sync {
    /// Persists `resource` at `path` and keeps it resident with one holder.
    /// A trailing `*` is replaced with a fresh UUID; returns the linked path.
    fn add_and_acquire(&self, path: &ResourcePath, resource: R) -> ResourceResult<ResourcePath>;

    /// Persists `resource` at `path` without keeping it resident.
    fn add_and_release(&self, path: &ResourcePath, resource: R) -> ResourceResult<ResourcePath>;

    /// Adds a holder, loading the resource if it is not resident.
    fn acquire(&self, id: ResourceId) -> ResourceResult<()>;

    /// Acquires the resource linked at `path` and returns its id.
    fn acquire_path(&self, path: &ResourcePath) -> ResourceResult<ResourceId>;

    /// Drops a holder. Returns true when this evicted the resource.
    fn release(&self, id: ResourceId) -> ResourceResult<bool>;

    /// Runs `f` against the resident resource.
    fn with_resource(
        &self,
        id: ResourceId,
        f: &mut dyn FnMut(&mut R) -> ResourceResult<()>,
    ) -> ResourceResult<()>;

    /// Linked paths matching `path`.
    fn list(&self, path: &ResourcePath) -> ResourceResult<Vec<Listing>>;

    /// Links resource `id` at `path` as well.
    fn link(&self, id: ResourceId, path: &ResourcePath) -> ResourceResult<()>;

    /// Links the resource at `source` at `destination` as well.
    fn link_path(&self, source: &ResourcePath, destination: &ResourcePath) -> ResourceResult<ResourceId>;

    /// Removes one link; the resource goes with its last link.
    fn unlink_path(&self, path: &ResourcePath) -> ResourceResult<Unlinked>;

    /// Removes every link matching `path`.
    fn unlink_multiple(&self, path: &ResourcePath) -> ResourceResult<Vec<Unlinked>>;

    /// Removes a resource with all its links.
    fn remove_resource(&self, id: ResourceId) -> ResourceResult<()>;

    /// Removes every resource linked at a path matching `path`.
    fn remove_resources(&self, path: &ResourcePath) -> ResourceResult<Vec<ResourceId>>;

    /// Removes everything.
    fn remove_all_resources(&self) -> ResourceResult<()>;

    /// Records a pending task against `id`.
    fn create_task(&self, id: ResourceId) -> ResourceResult<TaskId>;

    /// Clears a pending task; false if it was not pending.
    fn complete_task(&self, task: TaskId) -> ResourceResult<bool>;

    /// Pending tasks of `id`.
    fn pending_tasks(&self, id: ResourceId) -> ResourceResult<Vec<TaskId>>;

    /// Number of resident resources.
    fn in_memory_resource_count(&self) -> usize;
}

struct Resident<R> {
    resource: Arc<Mutex<R>>,
    refs: usize,
    hash: blake3::Hash,
}

/// [`ResourceService`] that commits every change through a
/// [`PersistenceEnvironment`] transaction before returning.
pub struct TransactionalResourceService<R: Resource> {
    env: PersistenceEnvironment,
    resident: DashMap<ResourceId, Resident<R>>,
    monitors: LockMap<ResourceId>,
    node_context: Option<String>,
}

impl<R: Resource> TransactionalResourceService<R> {
    /// Service over `env`. Paths without a context get `node_context`.
    pub fn new(env: PersistenceEnvironment, node_context: Option<String>) -> Self {
        Self {
            env,
            resident: DashMap::new(),
            monitors: LockMap::new(),
            node_context,
        }
    }

    /// Underlying environment.
    pub fn environment(&self) -> &PersistenceEnvironment {
        &self.env
    }

    /// Holders of a resident resource.
    pub fn holders(&self, id: ResourceId) -> usize {
        self.resident.get(&id).map_or(0, |r| r.refs)
    }

    fn normalize(&self, path: &ResourcePath) -> ResourcePath {
        match &self.node_context {
            Some(context) => path.with_context_if_absent(context),
            None => path.clone(),
        }
    }

    /// Scope over `paths` plus every resource currently linked under them.
    fn linked_scope(&self, paths: &[ResourcePath]) -> ResourceResult<TxnScope> {
        let scope = TxnScope::new().with_paths(paths.iter().cloned());
        let txn = self.env.begin_ro(scope.clone());
        let mut ids = Vec::new();
        for path in paths {
            ids.extend(txn.list(path)?.into_iter().map(|l| l.resource_id));
        }
        Ok(ids.into_iter().fold(scope, TxnScope::with_resource))
    }

    fn persist_new(&self, path: &ResourcePath, resource: &R) -> ResourceResult<(ResourcePath, blake3::Hash)> {
        let path = self.normalize(path);
        let id = resource.id();
        let bytes = resource.serialize()?;
        let hash = blake3::hash(&bytes);
        let mut txn = self
            .env
            .begin_rw(TxnScope::new().with_path(path.clone()).with_resource(id));
        let linked = txn.save_new_resource(&path, id, bytes)?;
        txn.commit()?;
        debug!(%id, path = %linked, "resource added");
        Ok((linked, hash))
    }

    fn evict(&self, id: ResourceId) {
        let _monitor = self.monitors.write(&id);
        if let Some((_, resident)) = self.resident.remove(&id) {
            resident.resource.lock().unload();
            trace!(%id, holders = resident.refs, "resource evicted");
        }
    }
}

impl<R: Resource> ResourceService<R> for TransactionalResourceService<R> {
    fn add_and_acquire(&self, path: &ResourcePath, resource: R) -> ResourceResult<ResourcePath> {
        let id = resource.id();
        let _monitor = self.monitors.write(&id);
        let (linked, hash) = self.persist_new(path, &resource)?;
        self.resident.insert(
            id,
            Resident {
                resource: Arc::new(Mutex::new(resource)),
                refs: 1,
                hash,
            },
        );
        Ok(linked)
    }

    fn add_and_release(&self, path: &ResourcePath, mut resource: R) -> ResourceResult<ResourcePath> {
        let (linked, _) = self.persist_new(path, &resource)?;
        resource.unload();
        Ok(linked)
    }

    fn acquire(&self, id: ResourceId) -> ResourceResult<()> {
        let _monitor = self.monitors.write(&id);
        if let Some(mut resident) = self.resident.get_mut(&id) {
            resident.refs += 1;
            return Ok(());
        }

        let bytes = {
            let txn = self.env.begin_ro(TxnScope::new().with_resource(id));
            txn.load_contents(id)?
        };
        let hash = blake3::hash(&bytes);
        let resource = R::deserialize(id, &bytes)?;
        self.resident.insert(
            id,
            Resident {
                resource: Arc::new(Mutex::new(resource)),
                refs: 1,
                hash,
            },
        );
        trace!(%id, bytes = bytes.len(), "resource loaded");
        Ok(())
    }

    fn acquire_path(&self, path: &ResourcePath) -> ResourceResult<ResourceId> {
        let path = self.normalize(path);
        let id = {
            let txn = self.env.begin_ro(TxnScope::new().with_path(path.clone()));
            txn.resource_id(&path)?
        };
        self.acquire(id)?;
        Ok(id)
    }

    fn release(&self, id: ResourceId) -> ResourceResult<bool> {
        let _monitor = self.monitors.write(&id);
        let (resource, stored) = {
            let mut resident = self
                .resident
                .get_mut(&id)
                .ok_or(ResourceError::NotResident { id })?;
            if resident.refs > 1 {
                resident.refs -= 1;
                return Ok(false);
            }
            (Arc::clone(&resident.resource), resident.hash)
        };

        // A failed write leaves the last holder in place.
        let bytes = resource.lock().serialize()?;
        if blake3::hash(&bytes) != stored {
            let len = bytes.len();
            let mut txn = self.env.begin_rw(TxnScope::new().with_resource(id));
            txn.update_resource(id, bytes)?;
            txn.commit()?;
            debug!(%id, bytes = len, "resource written back");
        }

        if let Some((_, resident)) = self.resident.remove(&id) {
            resident.resource.lock().unload();
        }
        trace!(%id, "resource released");
        Ok(true)
    }

    fn with_resource(
        &self,
        id: ResourceId,
        f: &mut dyn FnMut(&mut R) -> ResourceResult<()>,
    ) -> ResourceResult<()> {
        let resource = self
            .resident
            .get(&id)
            .map(|r| Arc::clone(&r.resource))
            .ok_or(ResourceError::NotResident { id })?;
        let mut guard = resource.lock();
        f(&mut guard)
    }

    fn list(&self, path: &ResourcePath) -> ResourceResult<Vec<Listing>> {
        let path = self.normalize(path);
        let txn = self.env.begin_ro(TxnScope::new().with_path(path.clone()));
        Ok(txn.list(&path)?)
    }

    fn link(&self, id: ResourceId, path: &ResourcePath) -> ResourceResult<()> {
        let path = self.normalize(path);
        let mut txn = self
            .env
            .begin_rw(TxnScope::new().with_path(path.clone()).with_resource(id));
        txn.link_new_resource(id, &path)?;
        txn.commit()?;
        debug!(%id, %path, "resource linked");
        Ok(())
    }

    fn link_path(&self, source: &ResourcePath, destination: &ResourcePath) -> ResourceResult<ResourceId> {
        let source = self.normalize(source);
        let destination = self.normalize(destination);
        let scope = self.linked_scope(&[source.clone(), destination.clone()])?;
        let mut txn = self.env.begin_rw(scope);
        let id = txn.link_existing(&source, &destination)?;
        txn.commit()?;
        debug!(%id, %source, %destination, "resource linked");
        Ok(id)
    }

    fn unlink_path(&self, path: &ResourcePath) -> ResourceResult<Unlinked> {
        let path = self.normalize(path);
        let scope = self.linked_scope(std::slice::from_ref(&path))?;
        let mut txn = self.env.begin_rw(scope);
        let unlinked = txn.unlink_path(&path)?;
        txn.commit()?;
        if unlinked.removed {
            self.evict(unlinked.resource_id);
        }
        debug!(%path, id = %unlinked.resource_id, removed = unlinked.removed, "path unlinked");
        Ok(unlinked)
    }

    fn unlink_multiple(&self, path: &ResourcePath) -> ResourceResult<Vec<Unlinked>> {
        let path = self.normalize(path);
        let scope = self.linked_scope(std::slice::from_ref(&path))?;
        let mut txn = self.env.begin_rw(scope);
        let mut unlinked = Vec::new();
        for listing in txn.list(&path)? {
            unlinked.push(txn.unlink_path(&listing.path)?);
        }
        txn.commit()?;
        for removed in unlinked.iter().filter(|u| u.removed) {
            self.evict(removed.resource_id);
        }
        debug!(%path, count = unlinked.len(), "paths unlinked");
        Ok(unlinked)
    }

    fn remove_resource(&self, id: ResourceId) -> ResourceResult<()> {
        let mut txn = self.env.begin_rw(TxnScope::new().with_resource(id));
        txn.remove_resource(id)?;
        txn.commit()?;
        self.evict(id);
        debug!(%id, "resource removed");
        Ok(())
    }

    fn remove_resources(&self, path: &ResourcePath) -> ResourceResult<Vec<ResourceId>> {
        let path = self.normalize(path);
        let scope = self.linked_scope(std::slice::from_ref(&path))?;
        let mut txn = self.env.begin_rw(scope);
        let removed = txn.remove_resources(&path)?;
        txn.commit()?;
        for id in &removed {
            self.evict(*id);
        }
        debug!(%path, count = removed.len(), "resources removed");
        Ok(removed)
    }

    fn remove_all_resources(&self) -> ResourceResult<()> {
        let mut txn = self.env.open_exclusive();
        let removed = txn.remove_all()?;
        txn.commit()?;
        let resident: Vec<ResourceId> = self.resident.iter().map(|r| *r.key()).collect();
        for id in resident {
            self.evict(id);
        }
        info!(count = removed.len(), "all resources removed");
        Ok(())
    }

    fn create_task(&self, id: ResourceId) -> ResourceResult<TaskId> {
        let mut txn = self.env.begin_rw(TxnScope::new().with_resource(id));
        let next = txn.tasks(id)?.iter().map(|t| t.task + 1).max().unwrap_or(0);
        let task = TaskId::new(id, next);
        txn.create_task(task)?;
        txn.commit()?;
        trace!(%task, "task recorded");
        Ok(task)
    }

    fn complete_task(&self, task: TaskId) -> ResourceResult<bool> {
        let mut txn = self.env.begin_rw(TxnScope::new().with_resource(task.resource_id));
        let cleared = txn.delete_task(task)?;
        txn.commit()?;
        Ok(cleared)
    }

    fn pending_tasks(&self, id: ResourceId) -> ResourceResult<Vec<TaskId>> {
        let txn = self.env.begin_ro(TxnScope::new().with_resource(id));
        Ok(txn.tasks(id)?)
    }

    fn in_memory_resource_count(&self) -> usize {
        self.resident.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::DocumentResource;
    use rtcore_persist::PersistenceConfig;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn service(dir: &std::path::Path) -> TransactionalResourceService<DocumentResource> {
        let env = PersistenceEnvironment::open(&PersistenceConfig::journal(dir).with_block_size(64)).unwrap();
        TransactionalResourceService::new(env, None)
    }

    fn document(name: &str) -> DocumentResource {
        let mut doc = DocumentResource::new();
        doc.set("name", name);
        doc
    }

    fn name_of(service: &TransactionalResourceService<DocumentResource>, id: ResourceId) -> String {
        let mut name = String::new();
        service
            .with_resource(id, &mut |doc| {
                name = doc.get("name").unwrap_or_default().to_string();
                Ok(())
            })
            .unwrap();
        name
    }

    #[test]
    fn test_add_and_acquire_keeps_resident() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("alpha");
        let id = doc.id();
        service.add_and_acquire(&p("/games/alpha"), doc).unwrap();
        assert_eq!(service.in_memory_resource_count(), 1);
        assert_eq!(name_of(&service, id), "alpha");
        assert!(service.release(id).unwrap());
        assert_eq!(service.in_memory_resource_count(), 0);
    }

    #[test]
    fn test_add_and_release_then_acquire_path() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("beta");
        let id = doc.id();
        service.add_and_release(&p("/games/beta"), doc).unwrap();
        assert_eq!(service.in_memory_resource_count(), 0);
        assert_eq!(service.acquire_path(&p("/games/beta")).unwrap(), id);
        assert_eq!(name_of(&service, id), "beta");
    }

    #[test]
    fn test_wildcard_add_generates_path() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let linked = service.add_and_release(&p("/games/*"), document("x")).unwrap();
        assert!(!linked.is_wildcard());
        assert_eq!(linked.parent(), p("/games"));
        assert_eq!(service.list(&p("/games/*")).unwrap().len(), 1);
    }

    #[test]
    fn test_release_is_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("gamma");
        let id = doc.id();
        service.add_and_acquire(&p("/g"), doc).unwrap();
        service.acquire(id).unwrap();
        assert_eq!(service.holders(id), 2);
        assert!(!service.release(id).unwrap());
        assert_eq!(service.in_memory_resource_count(), 1);
        assert!(service.release(id).unwrap());
        assert!(matches!(
            service.release(id),
            Err(ResourceError::NotResident { .. })
        ));
    }

    #[test]
    fn test_release_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let service = service(dir.path());
            let doc = document("before");
            let id = doc.id();
            service.add_and_acquire(&p("/g"), doc).unwrap();
            service
                .with_resource(id, &mut |doc| {
                    doc.set("name", "after");
                    Ok(())
                })
                .unwrap();
            service.release(id).unwrap();
            id
        };
        let service = service(dir.path());
        service.acquire(id).unwrap();
        assert_eq!(name_of(&service, id), "after");
    }

    #[test]
    fn test_unchanged_release_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("same");
        let id = doc.id();
        service.add_and_acquire(&p("/g"), doc).unwrap();
        let before = service.environment().begin_ro(TxnScope::new()).id();
        service.release(id).unwrap();
        let after = service.environment().begin_ro(TxnScope::new()).id();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_link_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("linked");
        let id = doc.id();
        service.add_and_acquire(&p("/a"), doc).unwrap();
        assert_eq!(service.link_path(&p("/a"), &p("/b")).unwrap(), id);
        service.link(id, &p("/c")).unwrap();

        assert!(!service.unlink_path(&p("/a")).unwrap().removed);
        assert!(!service.unlink_path(&p("/b")).unwrap().removed);
        assert_eq!(service.in_memory_resource_count(), 1);
        let last = service.unlink_path(&p("/c")).unwrap();
        assert!(last.removed);
        assert_eq!(service.in_memory_resource_count(), 0);
        assert!(service.acquire(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unlink_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        for name in ["x", "y", "z"] {
            service
                .add_and_release(&p(&format!("/tmp/{name}")), document(name))
                .unwrap();
        }
        service.add_and_release(&p("/keep"), document("k")).unwrap();
        let unlinked = service.unlink_multiple(&p("/tmp/*")).unwrap();
        assert_eq!(unlinked.len(), 3);
        assert!(unlinked.iter().all(|u| u.removed));
        assert_eq!(service.list(&p("/keep")).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_resources_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("r");
        let id = doc.id();
        service.add_and_acquire(&p("/r/1"), doc).unwrap();
        service.add_and_release(&p("/r/2"), document("s")).unwrap();
        let removed = service.remove_resources(&p("/r/*")).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&id));
        assert_eq!(service.in_memory_resource_count(), 0);
    }

    #[test]
    fn test_remove_resource_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("one");
        let id = doc.id();
        service.add_and_release(&p("/one"), doc).unwrap();
        service.add_and_acquire(&p("/two"), document("two")).unwrap();
        service.add_and_release(&p("/three"), document("three")).unwrap();

        service.remove_resource(id).unwrap();
        assert!(service.list(&p("/one")).unwrap().is_empty());

        service.remove_all_resources().unwrap();
        assert_eq!(service.in_memory_resource_count(), 0);
        assert_eq!(service.environment().resource_count(), 0);
    }

    #[test]
    fn test_node_context_applied() {
        let dir = tempfile::tempdir().unwrap();
        let env = PersistenceEnvironment::open(&PersistenceConfig::journal(dir.path())).unwrap();
        let service: TransactionalResourceService<DocumentResource> =
            TransactionalResourceService::new(env, Some("node1".to_string()));
        let linked = service.add_and_release(&p("/a"), document("a")).unwrap();
        assert_eq!(linked.context(), Some("node1"));
        assert_eq!(service.list(&p("/a")).unwrap().len(), 1);
        assert_eq!(service.list(&p("node1://a")).unwrap().len(), 1);
    }

    #[test]
    fn test_task_records() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let doc = document("tasks");
        let id = doc.id();
        service.add_and_release(&p("/t"), doc).unwrap();

        let first = service.create_task(id).unwrap();
        let second = service.create_task(id).unwrap();
        assert_eq!((first.task, second.task), (0, 1));
        assert_eq!(service.pending_tasks(id).unwrap(), vec![first, second]);

        assert!(service.complete_task(first).unwrap());
        assert!(!service.complete_task(first).unwrap());
        assert_eq!(service.pending_tasks(id).unwrap(), vec![second]);

        service.remove_resource(id).unwrap();
        assert!(service.create_task(id).unwrap_err().is_not_found());
    }
}
