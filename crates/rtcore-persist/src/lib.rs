#![warn(missing_docs)]

//! rtcore persistence subsystem: resource addressing, a transactional
//! environment with pessimistic locking, and two interchangeable durable
//! backends (a block journal and an embedded key-value store).

pub mod catalog;
pub mod config;
pub mod driver;
pub mod embedded;
pub mod environment;
pub mod error;
pub mod journal;
pub mod kv_store;
pub mod lock_master;
pub mod mutation;
pub mod scope;
pub mod types;

pub use catalog::Catalog;
pub use config::{
    BackendKind, EmbeddedConfig, JournalConfig, PersistenceConfig, SyncMode, DEFAULT_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};
pub use driver::PersistenceDriver;
pub use embedded::EmbeddedDriver;
pub use environment::{PersistenceEnvironment, ReadTransaction, WriteTransaction};
pub use error::{PersistError, PersistResult};
pub use journal::{JournalDriver, RecoveryReport};
pub use kv_store::{KvOp, KvStore};
pub use lock_master::{LockGrant, LockKey, LockMaster, LockMode};
pub use mutation::Mutation;
pub use scope::TxnScope;
pub use types::{Listing, ResourceId, ResourcePath, TaskId, Unlinked};
