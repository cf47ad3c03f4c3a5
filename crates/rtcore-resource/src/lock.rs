//! Per-resource and per-path lock monitors.
//!
//! Each key maps to its own reader/writer lock, created on first use and
//! dropped again once no monitor or waiter refers to it. Waiters are not
//! served in FIFO order.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use rtcore_persist::{ResourceId, ResourcePath};
use tracing::trace;

enum Guard {
    Read(#[allow(dead_code)] ArcRwLockReadGuard<RawRwLock, ()>),
    Write(#[allow(dead_code)] ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Lock table keyed by `K`.
pub struct LockMap<K: Eq + Hash + Clone> {
    locks: Arc<DashMap<K, Arc<RwLock<()>>>>,
}

impl<K> LockMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Empty table.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.entry(key.clone()).or_default().value())
    }

    /// Exclusive monitor on `key`; blocks until available.
    pub fn write(&self, key: &K) -> Monitor<K> {
        let guard = Guard::Write(self.lock_for(key).write_arc());
        self.monitor(key, guard)
    }

    /// Shared monitor on `key`; blocks while a writer holds it.
    pub fn read(&self, key: &K) -> Monitor<K> {
        let guard = Guard::Read(self.lock_for(key).read_arc());
        self.monitor(key, guard)
    }

    /// Exclusive monitor on `key` if it is free right now.
    pub fn try_write(&self, key: &K) -> Option<Monitor<K>> {
        let lock = self.lock_for(key);
        match lock.try_write_arc() {
            Some(guard) => Some(self.monitor(key, Guard::Write(guard))),
            None => {
                drop(lock);
                cleanup(&self.locks, key);
                None
            }
        }
    }

    fn monitor(&self, key: &K, guard: Guard) -> Monitor<K> {
        Monitor {
            locks: Arc::clone(&self.locks),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no key is locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for LockMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn cleanup<K: Eq + Hash>(locks: &DashMap<K, Arc<RwLock<()>>>, key: &K) {
    // Only the map's own reference left: nobody holds or awaits this key.
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

/// Held lock on one key; released on drop.
pub struct Monitor<K: Eq + Hash> {
    locks: Arc<DashMap<K, Arc<RwLock<()>>>>,
    key: K,
    guard: Option<Guard>,
}

impl<K: Eq + Hash> Monitor<K> {
    /// Locked key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// True for an exclusive monitor.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Some(Guard::Write(_)))
    }
}

impl<K: Eq + Hash> Drop for Monitor<K> {
    fn drop(&mut self) {
        self.guard.take();
        cleanup(&self.locks, &self.key);
    }
}

/// Lock monitors for resources, by id and by path.
#[derive(Default)]
pub struct ResourceLockService {
    resources: LockMap<ResourceId>,
    paths: LockMap<ResourcePath>,
}

impl ResourceLockService {
    /// Service with nothing locked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive monitor on a resource.
    pub fn lock_resource(&self, id: ResourceId) -> Monitor<ResourceId> {
        trace!(%id, "locking resource");
        self.resources.write(&id)
    }

    /// Shared monitor on a resource.
    pub fn read_resource(&self, id: ResourceId) -> Monitor<ResourceId> {
        self.resources.read(&id)
    }

    /// Exclusive monitor on a resource, if free.
    pub fn try_lock_resource(&self, id: ResourceId) -> Option<Monitor<ResourceId>> {
        self.resources.try_write(&id)
    }

    /// Exclusive monitor on a path.
    pub fn lock_path(&self, path: &ResourcePath) -> Monitor<ResourcePath> {
        trace!(%path, "locking path");
        self.paths.write(path)
    }

    /// Shared monitor on a path.
    pub fn read_path(&self, path: &ResourcePath) -> Monitor<ResourcePath> {
        self.paths.read(path)
    }

    /// Number of live lock entries across ids and paths.
    pub fn size(&self) -> usize {
        self.resources.len() + self.paths.len()
    }
}
