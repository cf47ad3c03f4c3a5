//! Non-blocking task submission.
//!
//! Work runs on the dispatcher runtime's blocking pool, since resource
//! tasks wait on lock monitors and persistence. Delays are timed on a
//! separate scheduled runtime that hands each task to the dispatcher when
//! it comes due.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::{ResourceError, ResourceResult};

/// Boxed unit of work.
pub type Task = Box<dyn FnOnce() -> ResourceResult<()> + Send + 'static>;

/// Scheduler thread pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Threads running tasks (default 8).
    pub dispatcher_threads: usize,
    /// Threads timing delayed tasks (default 1).
    pub scheduled_threads: usize,
    /// Thread name prefix.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatcher_threads: 8,
            scheduled_threads: 1,
            thread_name: "rtcore".to_string(),
        }
    }
}

/// Pending result of a submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<ResourceResult<T>>,
    abort: Option<AbortHandle>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes. Must not be called from async code.
    pub fn wait(mut self) -> ResourceResult<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(ResourceError::TaskCancelled))
    }

    /// Waits for the task from async code.
    pub async fn join(self) -> ResourceResult<T> {
        self.rx.await.unwrap_or(Err(ResourceError::TaskCancelled))
    }

    /// Cancels a delayed task that has not started; running tasks finish.
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Submits work for asynchronous execution.
pub trait Scheduler: Send + Sync {
    /// Runs `task` as soon as a dispatcher thread is free.
    fn submit(&self, task: Task) -> TaskHandle<()>;

    /// Runs `task` after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle<()>;
}

fn run_logged<T, F>(task: F) -> ResourceResult<T>
where
    F: FnOnce() -> ResourceResult<T>,
{
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(error = %e, "scheduled task failed");
            Err(e)
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(reason = %reason, "scheduled task panicked");
            Err(ResourceError::TaskPanicked { reason })
        }
    }
}

/// Scheduler backed by a dispatcher runtime and a scheduled runtime.
pub struct SimpleScheduler {
    dispatcher: Runtime,
    scheduled: Runtime,
}

impl SimpleScheduler {
    /// Starts both pools.
    pub fn new(config: &SchedulerConfig) -> ResourceResult<Self> {
        let dispatcher = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.dispatcher_threads.max(1))
            .thread_name(format!("{}-dispatch", config.thread_name))
            .enable_all()
            .build()
            .map_err(|e| ResourceError::Internal(format!("dispatcher runtime: {e}")))?;
        let scheduled = Builder::new_multi_thread()
            .worker_threads(config.scheduled_threads.max(1))
            .thread_name(format!("{}-scheduled", config.thread_name))
            .enable_time()
            .build()
            .map_err(|e| ResourceError::Internal(format!("scheduled runtime: {e}")))?;
        debug!(
            dispatcher_threads = config.dispatcher_threads,
            scheduled_threads = config.scheduled_threads,
            "scheduler started"
        );
        Ok(Self {
            dispatcher,
            scheduled,
        })
    }

    /// Runs `task` on the dispatcher and returns its result handle.
    pub fn spawn<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ResourceResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.spawn_blocking(move || {
            let _ = tx.send(run_logged(task));
        });
        TaskHandle { rx, abort: None }
    }

    /// Runs `task` on the dispatcher once `delay` has passed.
    pub fn spawn_after<T, F>(&self, delay: Duration, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ResourceResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let dispatcher = self.dispatcher.handle().clone();
        let timer = self.scheduled.spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.spawn_blocking(move || {
                let _ = tx.send(run_logged(task));
            });
        });
        TaskHandle {
            rx,
            abort: Some(timer.abort_handle()),
        }
    }

    /// Stops both pools, waiting up to `timeout` for running tasks.
    pub fn shutdown(self, timeout: Duration) {
        self.scheduled.shutdown_timeout(timeout);
        self.dispatcher.shutdown_timeout(timeout);
        debug!("scheduler stopped");
    }
}

impl Scheduler for SimpleScheduler {
    fn submit(&self, task: Task) -> TaskHandle<()> {
        self.spawn(task)
    }

    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle<()> {
        self.spawn_after(delay, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    fn scheduler() -> SimpleScheduler {
        SimpleScheduler::new(&SchedulerConfig {
            dispatcher_threads: 4,
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_submit_returns_value() {
        let scheduler = scheduler();
        assert_eq!(scheduler.spawn(|| Ok(21 * 2)).wait().unwrap(), 42);
    }

    #[test]
    fn test_failure_is_reported_not_fatal() {
        let scheduler = scheduler();
        let failed = scheduler.spawn::<(), _>(|| Err(ResourceError::Internal("boom".into())));
        assert!(matches!(failed.wait(), Err(ResourceError::Internal(_))));
        let panicked = scheduler.spawn::<(), _>(|| panic!("kaboom"));
        assert!(matches!(
            panicked.wait(),
            Err(ResourceError::TaskPanicked { reason }) if reason == "kaboom"
        ));
        assert!(scheduler.spawn(|| Ok(())).wait().is_ok());
    }

    #[test]
    fn test_delays_run_in_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = [60u64, 20, 40]
            .into_iter()
            .map(|ms| {
                let order = Arc::clone(&order);
                scheduler.spawn_after(Duration::from_millis(ms), move || {
                    order.lock().push(ms);
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock(), vec![20, 40, 60]);
    }

    #[test]
    fn test_delay_is_honored() {
        let scheduler = scheduler();
        let start = Instant::now();
        scheduler
            .schedule(Duration::from_millis(30), Box::new(|| Ok(())))
            .wait()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_pending_delay() {
        let scheduler = scheduler();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let handle = scheduler.spawn_after(Duration::from_millis(200), move || {
            *flag.lock() = true;
            Ok(())
        });
        handle.cancel();
        assert!(matches!(handle.wait(), Err(ResourceError::TaskCancelled)));
        assert!(!*ran.lock());
    }
}
