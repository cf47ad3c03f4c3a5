//! Entry point tying the lock service, the scheduler and a resource service
//! together.
//!
//! Every operation on a resource id first takes that id's monitor from the
//! [`ResourceLockService`], so an acquire and a scheduled release of the same
//! id never overlap, whichever thread runs them.

use std::sync::Arc;
use std::time::Duration;

use rtcore_persist::{PersistenceEnvironment, ResourceId, ResourcePath, TaskId, Unlinked};
use tracing::{debug, warn};

use crate::error::{ResourceError, ResourceResult};
use crate::lock::{Monitor, ResourceLockService};
use crate::resource::Resource;
use crate::scheduler::{SchedulerConfig, SimpleScheduler, TaskHandle};
use crate::service::{ResourceService, TransactionalResourceService};

struct Shared<R: Resource> {
    locks: ResourceLockService,
    service: Arc<dyn ResourceService<R>>,
}

impl<R: Resource> Shared<R> {
    fn release(&self, id: ResourceId) -> ResourceResult<bool> {
        let _monitor = self.locks.lock_resource(id);
        self.service.release(id)
    }

    fn finish_task(&self, task: TaskId) {
        match self.service.complete_task(task) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%task, error = %e, "failed to clear task record"),
        }
    }

    fn perform<T, F>(&self, id: ResourceId, op: F) -> ResourceResult<T>
    where
        F: FnOnce(&mut R) -> ResourceResult<T>,
    {
        let _monitor = self.locks.lock_resource(id);
        self.service.acquire(id)?;
        let result = with_resource(self.service.as_ref(), id, op);
        let released = self.service.release(id);
        let value = result?;
        released?;
        Ok(value)
    }
}

fn with_resource<R, T, F>(service: &dyn ResourceService<R>, id: ResourceId, op: F) -> ResourceResult<T>
where
    R: Resource,
    F: FnOnce(&mut R) -> ResourceResult<T>,
{
    let mut op = Some(op);
    let mut out = None;
    service.with_resource(id, &mut |resource| {
        if let Some(op) = op.take() {
            out = Some(op(resource)?);
        }
        Ok(())
    })?;
    out.ok_or_else(|| ResourceError::Internal(format!("operation on {id} did not run")))
}

/// A resource held through [`ResourceRuntime::acquire`].
///
/// The guard keeps the id's monitor; dropping it lets the next acquirer in
/// but keeps the resource resident until [`ResourceRuntime::schedule_release`]
/// or [`AcquiredResource::release`].
pub struct AcquiredResource<R: Resource> {
    shared: Arc<Shared<R>>,
    id: ResourceId,
    _monitor: Monitor<ResourceId>,
}

impl<R: Resource> AcquiredResource<R> {
    /// Id of the held resource.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Runs `op` against the resource.
    pub fn with<T, F>(&self, op: F) -> ResourceResult<T>
    where
        F: FnOnce(&mut R) -> ResourceResult<T>,
    {
        with_resource(self.shared.service.as_ref(), self.id, op)
    }

    /// Releases the holder now, under the monitor this guard owns.
    pub fn release(self) -> ResourceResult<bool> {
        self.shared.service.release(self.id)
    }
}

/// Resource runtime for resources of type `R`.
pub struct ResourceRuntime<R: Resource> {
    shared: Arc<Shared<R>>,
    scheduler: SimpleScheduler,
}

impl<R: Resource> ResourceRuntime<R> {
    /// Runtime over an existing resource service.
    pub fn new(service: Arc<dyn ResourceService<R>>, config: &SchedulerConfig) -> ResourceResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                locks: ResourceLockService::new(),
                service,
            }),
            scheduler: SimpleScheduler::new(config)?,
        })
    }

    /// Runtime persisting through `env`.
    pub fn open(
        env: PersistenceEnvironment,
        node_context: Option<String>,
        config: &SchedulerConfig,
    ) -> ResourceResult<Self> {
        debug!(backend = env.backend_name(), "resource runtime opening");
        let service = TransactionalResourceService::<R>::new(env, node_context);
        Self::new(Arc::new(service), config)
    }

    /// The resource service.
    pub fn service(&self) -> &Arc<dyn ResourceService<R>> {
        &self.shared.service
    }

    /// The lock service.
    pub fn locks(&self) -> &ResourceLockService {
        &self.shared.locks
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &SimpleScheduler {
        &self.scheduler
    }

    /// Takes the id's monitor, then loads the resource. Blocks while another
    /// caller holds the monitor.
    pub fn acquire(&self, id: ResourceId) -> ResourceResult<AcquiredResource<R>> {
        let monitor = self.shared.locks.lock_resource(id);
        self.shared.service.acquire(id)?;
        Ok(AcquiredResource {
            shared: Arc::clone(&self.shared),
            id,
            _monitor: monitor,
        })
    }

    /// Releases one holder in the background, under the id's monitor.
    pub fn schedule_release(&self, id: ResourceId) -> TaskHandle<bool> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn(move || shared.release(id))
    }

    /// Acquires, runs `op`, and releases, in the background.
    pub fn perform<T, F>(&self, id: ResourceId, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> ResourceResult<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn(move || shared.perform(id, op))
    }

    /// [`ResourceRuntime::perform`] after `delay`.
    ///
    /// A pending task record is stored with the resource until the operation
    /// has run; a cancelled task leaves its record behind.
    pub fn perform_after_delay<T, F>(&self, id: ResourceId, delay: Duration, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> ResourceResult<T> + Send + 'static,
    {
        let task = match self.shared.service.create_task(id) {
            Ok(task) => task,
            Err(e) => return self.scheduler.spawn(move || Err(e)),
        };
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn_after(delay, move || {
            let result = shared.perform(id, op);
            shared.finish_task(task);
            result
        })
    }

    /// Unlinks `path` after `delay`, under the path's monitor.
    pub fn schedule_unlink(&self, path: ResourcePath, delay: Duration) -> TaskHandle<Unlinked> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn_after(delay, move || {
            let _monitor = shared.locks.lock_path(&path);
            shared.service.unlink_path(&path)
        })
    }

    /// Removes resource `id` after `delay`, under the id's monitor.
    pub fn schedule_destruction(&self, id: ResourceId, delay: Duration) -> TaskHandle<()> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.spawn_after(delay, move || {
            let _monitor = shared.locks.lock_resource(id);
            match shared.service.remove_resource(id) {
                Err(e) if e.is_not_found() => {
                    warn!(%id, "resource already gone before scheduled destruction");
                    Ok(())
                }
                other => other,
            }
        })
    }

    /// Stops the scheduler, waiting up to `timeout` for running tasks.
    pub fn shutdown(self, timeout: Duration) {
        self.scheduler.shutdown(timeout);
    }
}
