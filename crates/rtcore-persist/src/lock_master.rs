//! Pessimistic locking master for persistence transactions.
//!
//! A transaction acquires every key of its scope at once or waits; it never
//! holds a partial set, so two transactions cannot deadlock on each other's
//! keys. Whole-store transactions take the exclusive lock, which waits for
//! every keyed transaction to finish and blocks new ones.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use tracing::trace;

use crate::types::{ResourceId, ResourcePath};

/// One lockable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockKey {
    /// A path, possibly a wildcard.
    Path(ResourcePath),
    /// A resource id.
    Resource(ResourceId),
}

impl LockKey {
    /// Paths conflict when they match each other; ids when equal.
    pub fn conflicts_with(&self, other: &LockKey) -> bool {
        match (self, other) {
            (LockKey::Path(a), LockKey::Path(b)) => a.matches(b),
            (LockKey::Resource(a), LockKey::Resource(b)) => a == b,
            _ => false,
        }
    }
}

/// Shared or exclusive access to a key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers may share a key.
    Read,
    /// One writer excludes everyone else.
    Write,
}

struct HeldLock {
    grant: u64,
    mode: LockMode,
    keys: Vec<LockKey>,
}

#[derive(Default)]
struct LockTable {
    held: Vec<HeldLock>,
    next_grant: u64,
}

impl LockTable {
    fn is_free(&self, keys: &[LockKey], mode: LockMode) -> bool {
        self.held.iter().all(|held| {
            (mode == LockMode::Read && held.mode == LockMode::Read)
                || !held
                    .keys
                    .iter()
                    .any(|h| keys.iter().any(|k| k.conflicts_with(h)))
        })
    }
}

/// Grants and tracks transaction locks.
pub struct LockMaster {
    table: Mutex<LockTable>,
    released: Condvar,
    store: Arc<RwLock<()>>,
}

enum StoreGuard {
    Shared(#[allow(dead_code)] ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(#[allow(dead_code)] ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Locks held by one transaction; released on drop.
pub struct LockGrant {
    master: Arc<LockMaster>,
    grant: Option<u64>,
    store: StoreGuard,
}

impl LockMaster {
    /// Creates a master with nothing held.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            store: Arc::new(RwLock::new(())),
        })
    }

    /// Blocks until every key is available in `mode`, then takes them all.
    pub fn acquire(self: &Arc<Self>, keys: Vec<LockKey>, mode: LockMode) -> LockGrant {
        let store = StoreGuard::Shared(self.store.read_arc());
        let mut table = self.table.lock();
        while !table.is_free(&keys, mode) {
            trace!(keys = keys.len(), ?mode, "waiting for transaction locks");
            self.released.wait(&mut table);
        }
        let grant = table.next_grant;
        table.next_grant += 1;
        table.held.push(HeldLock { grant, mode, keys });
        LockGrant {
            master: Arc::clone(self),
            grant: Some(grant),
            store,
        }
    }

    /// Non-blocking [`LockMaster::acquire`].
    pub fn try_acquire(self: &Arc<Self>, keys: Vec<LockKey>, mode: LockMode) -> Option<LockGrant> {
        let store = StoreGuard::Shared(self.store.try_read_arc()?);
        let mut table = self.table.lock();
        if !table.is_free(&keys, mode) {
            return None;
        }
        let grant = table.next_grant;
        table.next_grant += 1;
        table.held.push(HeldLock { grant, mode, keys });
        Some(LockGrant {
            master: Arc::clone(self),
            grant: Some(grant),
            store,
        })
    }

    /// Blocks until no other transaction is open, then locks the whole store.
    pub fn acquire_exclusive(self: &Arc<Self>) -> LockGrant {
        LockGrant {
            master: Arc::clone(self),
            grant: None,
            store: StoreGuard::Exclusive(self.store.write_arc()),
        }
    }

    /// Number of keyed grants currently held.
    pub fn held_count(&self) -> usize {
        self.table.lock().held.len()
    }

    fn release(&self, grant: u64) {
        let mut table = self.table.lock();
        table.held.retain(|held| held.grant != grant);
        drop(table);
        self.released.notify_all();
    }
}

impl LockGrant {
    /// True for a whole-store grant.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.store, StoreGuard::Exclusive(_))
    }
}

impl Drop for LockGrant {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            self.master.release(grant);
        }
    }
}
