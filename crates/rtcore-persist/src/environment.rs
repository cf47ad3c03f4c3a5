//! Transactional persistence environment.
//!
//! Transactions lock their scope in the [`LockMaster`] before touching
//! anything. Write transactions work on a private copy of the scoped part of
//! the catalog and buffer their mutations; `commit` hands the batch to the
//! driver and applies it to the shared catalog only once it is durable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::catalog::Catalog;
use crate::config::{BackendKind, PersistenceConfig};
use crate::driver::PersistenceDriver;
use crate::embedded::EmbeddedDriver;
use crate::error::{PersistError, PersistResult};
use crate::journal::JournalDriver;
use crate::lock_master::{LockGrant, LockMaster, LockMode};
use crate::mutation::Mutation;
use crate::scope::TxnScope;
use crate::types::{Listing, ResourceId, ResourcePath, TaskId, Unlinked};

struct EnvInner {
    config: PersistenceConfig,
    driver: Mutex<Box<dyn PersistenceDriver>>,
    catalog: RwLock<Catalog>,
    locks: Arc<LockMaster>,
    next_txn: AtomicU64,
}

/// Shared handle to an open persistence store.
#[derive(Clone)]
pub struct PersistenceEnvironment {
    inner: Arc<EnvInner>,
}

impl PersistenceEnvironment {
    /// Opens the backend selected by `config` and recovers its catalog.
    pub fn open(config: &PersistenceConfig) -> PersistResult<Self> {
        config.validate()?;
        let block_size = config.block_size();
        let driver: Box<dyn PersistenceDriver> = match config.backend {
            BackendKind::Journal => Box::new(JournalDriver::open(&config.journal, block_size)?),
            BackendKind::Embedded => Box::new(EmbeddedDriver::open(&config.embedded, block_size)?),
        };
        Self::with_driver(config.clone(), driver)
    }

    /// Wraps an already opened driver.
    pub fn with_driver(config: PersistenceConfig, driver: Box<dyn PersistenceDriver>) -> PersistResult<Self> {
        let catalog = driver.load_catalog()?;
        info!(
            backend = driver.name(),
            block_size = config.block_size(),
            resources = catalog.resource_count(),
            paths = catalog.path_count(),
            "persistence environment open"
        );
        Ok(Self {
            inner: Arc::new(EnvInner {
                config,
                driver: Mutex::new(driver),
                catalog: RwLock::new(catalog),
                locks: LockMaster::new(),
                next_txn: AtomicU64::new(1),
            }),
        })
    }

    /// Configuration the environment was opened with.
    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &'static str {
        self.inner.driver.lock().name()
    }

    /// Starts a read transaction over `scope`, blocking until its locks are free.
    pub fn begin_ro(&self, scope: TxnScope) -> ReadTransaction {
        let grant = if scope.is_all() {
            self.inner.locks.acquire_exclusive()
        } else {
            self.inner.locks.acquire(scope.lock_keys(), LockMode::Read)
        };
        let txn = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        trace!(txn, "read transaction started");
        ReadTransaction {
            inner: Arc::clone(&self.inner),
            txn,
            scope,
            _grant: grant,
        }
    }

    /// Starts a write transaction over `scope`, blocking until its locks are free.
    pub fn begin_rw(&self, scope: TxnScope) -> WriteTransaction {
        let grant = if scope.is_all() {
            self.inner.locks.acquire_exclusive()
        } else {
            self.inner.locks.acquire(scope.lock_keys(), LockMode::Write)
        };
        self.write_transaction(scope, grant)
    }

    /// Starts a write transaction over the whole store.
    pub fn open_exclusive(&self) -> WriteTransaction {
        let grant = self.inner.locks.acquire_exclusive();
        self.write_transaction(TxnScope::all(), grant)
    }

    fn write_transaction(&self, scope: TxnScope, grant: LockGrant) -> WriteTransaction {
        let working = self.inner.catalog.read().extract(&scope);
        let covered: HashSet<ResourceId> = working.resource_ids().collect();
        let txn = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        trace!(txn, exclusive = grant.is_exclusive(), "write transaction started");
        WriteTransaction {
            inner: Arc::clone(&self.inner),
            txn,
            scope,
            working,
            pending: Vec::new(),
            contents: HashMap::new(),
            covered,
            open: true,
            _grant: grant,
        }
    }

    /// Folds the backend's log into a checkpoint.
    pub fn compact(&self) -> PersistResult<()> {
        let grant = self.inner.locks.acquire_exclusive();
        let result = self.inner.driver.lock().compact();
        drop(grant);
        result
    }

    /// Number of resources in the committed catalog.
    pub fn resource_count(&self) -> usize {
        self.inner.catalog.read().resource_count()
    }
}

fn require_concrete(path: &ResourcePath) -> PersistResult<()> {
    if path.is_wildcard() {
        return Err(PersistError::WildcardNotAllowed {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Read-only view of a scope.
pub struct ReadTransaction {
    inner: Arc<EnvInner>,
    txn: u64,
    scope: TxnScope,
    _grant: LockGrant,
}

impl ReadTransaction {
    /// Transaction number, for logs.
    pub fn id(&self) -> u64 {
        self.txn
    }

    fn check_path(&self, path: &ResourcePath) -> PersistResult<()> {
        if self.scope.covers_path(path) {
            Ok(())
        } else {
            Err(PersistError::out_of_scope(path))
        }
    }

    fn check_resource(&self, catalog: &Catalog, id: ResourceId) -> PersistResult<()> {
        if self.scope.names_resource(id) || catalog.paths_of(id).any(|p| self.scope.covers_path(p)) {
            Ok(())
        } else {
            Err(PersistError::out_of_scope(id))
        }
    }

    /// True if `path` is linked.
    pub fn exists(&self, path: &ResourcePath) -> PersistResult<bool> {
        self.check_path(path)?;
        Ok(self.inner.catalog.read().resource_id(path).is_some())
    }

    /// Listings matching `path` within the scope.
    pub fn list(&self, path: &ResourcePath) -> PersistResult<Vec<Listing>> {
        self.check_path(path)?;
        let catalog = self.inner.catalog.read();
        Ok(catalog
            .list(path)
            .into_iter()
            .filter(|l| self.scope.covers_path(&l.path))
            .collect())
    }

    /// Resource linked at `path`.
    pub fn resource_id(&self, path: &ResourcePath) -> PersistResult<ResourceId> {
        self.check_path(path)?;
        self.inner
            .catalog
            .read()
            .resource_id(path)
            .ok_or_else(|| PersistError::not_found(path))
    }

    /// Serialized contents of `id`.
    pub fn load_contents(&self, id: ResourceId) -> PersistResult<Vec<u8>> {
        {
            let catalog = self.inner.catalog.read();
            self.check_resource(&catalog, id)?;
            if !catalog.contains(id) {
                return Err(PersistError::not_found(id));
            }
        }
        self.inner
            .driver
            .lock()
            .load_contents(id)?
            .ok_or_else(|| PersistError::not_found(id))
    }

    /// Pending tasks of `id`.
    pub fn tasks(&self, id: ResourceId) -> PersistResult<Vec<TaskId>> {
        let catalog = self.inner.catalog.read();
        self.check_resource(&catalog, id)?;
        Ok(catalog.tasks(id))
    }
}

/// Buffered changes over a scope; rolled back if dropped uncommitted.
pub struct WriteTransaction {
    inner: Arc<EnvInner>,
    txn: u64,
    scope: TxnScope,
    working: Catalog,
    pending: Vec<Mutation>,
    contents: HashMap<ResourceId, Option<Vec<u8>>>,
    covered: HashSet<ResourceId>,
    open: bool,
    _grant: LockGrant,
}

impl WriteTransaction {
    /// Transaction number, for logs.
    pub fn id(&self) -> u64 {
        self.txn
    }

    /// Mutations buffered so far.
    pub fn pending(&self) -> &[Mutation] {
        &self.pending
    }

    fn record(&mut self, mutation: Mutation) {
        match &mutation {
            Mutation::PutContents { id, contents } => {
                self.contents.insert(*id, Some(contents.clone()));
            }
            Mutation::DeleteResource { id } => {
                self.contents.insert(*id, None);
            }
            Mutation::CreateResource { id } => {
                self.covered.insert(*id);
            }
            _ => {}
        }
        self.working.apply(&mutation);
        self.pending.push(mutation);
    }

    fn check_path(&self, path: &ResourcePath) -> PersistResult<()> {
        if self.scope.covers_path(path) {
            Ok(())
        } else {
            Err(PersistError::out_of_scope(path))
        }
    }

    fn check_resource(&self, id: ResourceId) -> PersistResult<()> {
        if !self.scope.names_resource(id) && !self.covered.contains(&id) {
            return Err(PersistError::out_of_scope(id));
        }
        if !self.working.contains(id) {
            return Err(PersistError::not_found(id));
        }
        Ok(())
    }

    /// True if `path` is linked, counting this transaction's changes.
    pub fn exists(&self, path: &ResourcePath) -> PersistResult<bool> {
        self.check_path(path)?;
        Ok(self.working.resource_id(path).is_some())
    }

    /// Listings matching `path` within the scope.
    pub fn list(&self, path: &ResourcePath) -> PersistResult<Vec<Listing>> {
        self.check_path(path)?;
        Ok(self
            .working
            .list(path)
            .into_iter()
            .filter(|l| self.scope.covers_path(&l.path))
            .collect())
    }

    /// Resource linked at `path`.
    pub fn resource_id(&self, path: &ResourcePath) -> PersistResult<ResourceId> {
        self.check_path(path)?;
        self.working
            .resource_id(path)
            .ok_or_else(|| PersistError::not_found(path))
    }

    /// Serialized contents of `id`, including buffered updates.
    pub fn load_contents(&self, id: ResourceId) -> PersistResult<Vec<u8>> {
        self.check_resource(id)?;
        if let Some(buffered) = self.contents.get(&id) {
            return buffered.clone().ok_or_else(|| PersistError::not_found(id));
        }
        self.inner
            .driver
            .lock()
            .load_contents(id)?
            .ok_or_else(|| PersistError::not_found(id))
    }

    /// Creates a resource linked at `path`; a trailing wildcard is replaced
    /// with a fresh UUID. Returns the path actually linked.
    pub fn save_new_resource(
        &mut self,
        path: &ResourcePath,
        id: ResourceId,
        contents: Vec<u8>,
    ) -> PersistResult<ResourcePath> {
        let path = path.append_uuid_if_wildcard();
        require_concrete(&path)?;
        self.check_path(&path)?;
        if self.working.resource_id(&path).is_some() {
            return Err(PersistError::duplicate(&path));
        }
        if self.working.contains(id) || self.inner.catalog.read().contains(id) {
            return Err(PersistError::duplicate(id));
        }

        self.record(Mutation::CreateResource { id });
        self.record(Mutation::PutContents { id, contents });
        self.record(Mutation::LinkPath {
            path: path.clone(),
            id,
        });
        Ok(path)
    }

    /// Replaces the contents of an existing resource.
    pub fn update_resource(&mut self, id: ResourceId, contents: Vec<u8>) -> PersistResult<()> {
        self.check_resource(id)?;
        self.record(Mutation::PutContents { id, contents });
        Ok(())
    }

    /// Links an existing resource at an additional path.
    pub fn link_new_resource(&mut self, id: ResourceId, path: &ResourcePath) -> PersistResult<()> {
        require_concrete(path)?;
        self.check_path(path)?;
        self.check_resource(id)?;
        if self.working.resource_id(path).is_some() {
            return Err(PersistError::duplicate(path));
        }
        self.record(Mutation::LinkPath {
            path: path.clone(),
            id,
        });
        Ok(())
    }

    /// Links the resource at `source` at `destination` too.
    pub fn link_existing(&mut self, source: &ResourcePath, destination: &ResourcePath) -> PersistResult<ResourceId> {
        require_concrete(source)?;
        let id = self.resource_id(source)?;
        self.link_new_resource(id, destination)?;
        Ok(id)
    }

    /// Removes the link at `path`; the resource goes too when it was the last.
    pub fn unlink_path(&mut self, path: &ResourcePath) -> PersistResult<Unlinked> {
        require_concrete(path)?;
        let id = self.resource_id(path)?;
        self.record(Mutation::UnlinkPath {
            path: path.clone(),
            id,
        });

        let removed = self.working.paths_of(id).next().is_none();
        if removed {
            self.delete(id);
        }
        Ok(Unlinked {
            resource_id: id,
            removed,
        })
    }

    fn delete(&mut self, id: ResourceId) {
        for task in self.working.tasks(id) {
            self.record(Mutation::DeleteTask { task });
        }
        self.record(Mutation::DeleteResource { id });
    }

    /// Removes a resource, every path linking it and its tasks.
    pub fn remove_resource(&mut self, id: ResourceId) -> PersistResult<()> {
        self.check_resource(id)?;
        let paths: Vec<ResourcePath> = self.working.paths_of(id).cloned().collect();
        for path in paths {
            self.record(Mutation::UnlinkPath { path, id });
        }
        self.delete(id);
        Ok(())
    }

    /// Removes every resource linked at a path matching `path`.
    pub fn remove_resources(&mut self, path: &ResourcePath) -> PersistResult<Vec<ResourceId>> {
        let mut removed = Vec::new();
        for listing in self.list(path)? {
            if self.working.contains(listing.resource_id) {
                self.remove_resource(listing.resource_id)?;
                removed.push(listing.resource_id);
            }
        }
        Ok(removed)
    }

    /// Removes every resource the scope can see.
    pub fn remove_all(&mut self) -> PersistResult<Vec<ResourceId>> {
        let ids: Vec<ResourceId> = self.working.resource_ids().collect();
        for id in &ids {
            self.remove_resource(*id)?;
        }
        Ok(ids)
    }

    /// Records a pending task.
    pub fn create_task(&mut self, task: TaskId) -> PersistResult<()> {
        self.check_resource(task.resource_id)?;
        if self.working.has_task(task) {
            return Err(PersistError::duplicate(task));
        }
        self.record(Mutation::PutTask { task });
        Ok(())
    }

    /// Clears a pending task; false if it was not pending.
    pub fn delete_task(&mut self, task: TaskId) -> PersistResult<bool> {
        self.check_resource(task.resource_id)?;
        if !self.working.has_task(task) {
            return Ok(false);
        }
        self.record(Mutation::DeleteTask { task });
        Ok(true)
    }

    /// Pending tasks of `id`.
    pub fn tasks(&self, id: ResourceId) -> PersistResult<Vec<TaskId>> {
        self.check_resource(id)?;
        Ok(self.working.tasks(id))
    }

    /// Makes every buffered change durable, then publishes it.
    pub fn commit(mut self) -> PersistResult<()> {
        self.open = false;
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = std::mem::take(&mut self.pending);

        let mut driver = self.inner.driver.lock();
        let orphans = self.inner.catalog.read().orphans(&batch);
        if !orphans.is_empty() {
            debug!(txn = self.txn, extra = orphans.len(), "removing resources left without a path");
            batch.extend(orphans);
        }
        driver.apply(&batch)?;
        self.inner.catalog.write().apply_all(&batch);
        drop(driver);

        debug!(txn = self.txn, mutations = batch.len(), "transaction committed");
        Ok(())
    }

    /// Discards every buffered change.
    pub fn rollback(mut self) {
        self.open = false;
        trace!(txn = self.txn, discarded = self.pending.len(), "transaction rolled back");
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.open && !self.pending.is_empty() {
            debug!(txn = self.txn, discarded = self.pending.len(), "uncommitted transaction dropped");
        }
    }
}
