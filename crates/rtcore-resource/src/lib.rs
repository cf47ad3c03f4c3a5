#![warn(missing_docs)]

//! rtcore resource layer: per-resource lock monitors, background task
//! scheduling, and the resource lifecycle service backed by the
//! persistence environment.

pub mod error;
pub mod lock;
pub mod resource;
pub mod runtime;
pub mod scheduler;
pub mod service;

pub use error::{ResourceError, ResourceResult};
pub use lock::{LockMap, Monitor, ResourceLockService};
pub use resource::{DocumentResource, Resource};
pub use runtime::{AcquiredResource, ResourceRuntime};
pub use scheduler::{Scheduler, SchedulerConfig, SimpleScheduler, Task, TaskHandle};
pub use service::{ResourceService, TransactionalResourceService};

pub use rtcore_persist::{
    Listing, PersistenceConfig, PersistenceEnvironment, ResourceId, ResourcePath, TaskId, TxnScope,
    Unlinked,
};
