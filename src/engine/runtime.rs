//! Worker runtime for KyroMem operations.
//!
//! [`KyroMem`] itself is synchronous. Hosts that must keep slow provider calls
//! (embedding, judging) from delaying store-only work run operations through
//! [`MemRuntime`], which owns two bounded worker pools:
//!
//! - `store`: branch, merge, snapshot, graph and time-travel operations
//! - `external`: anything that may call an embedding provider or a judge
//!
//! Every submission returns a [`TaskHandle`] that can be joined (optionally with a
//! timeout) or cancelled. Cancellation is cooperative: the task's
//! [`CancellationToken`] is checked before it starts and before it commits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::context::{CancellationToken, RequestContext};
use crate::engine::KyroMem;
use crate::error::{ExecutionError, KyroMemResult, ValidationError};

/// Which pool a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Store-only work.
    Store,
    /// Work that may block on an external provider.
    External,
}

impl Pool {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::External => "external",
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of store workers.
    pub store_workers: usize,
    /// Number of external workers.
    pub external_workers: usize,
    /// Maximum queued tasks per pool.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_workers: 2,
            external_workers: 2,
            queue_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Validates worker and queue sizes.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if any size is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        for (field, value) in [
            ("store_workers", self.store_workers),
            ("external_workers", self.external_workers),
            ("queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{field} must be at least 1"),
                });
            }
        }
        Ok(self)
    }
}

type Job = Box<dyn FnOnce(&KyroMem) + Send + 'static>;

struct WorkerPool {
    pool: Pool,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(pool: Pool, workers: usize, queue_capacity: usize, mem: &Arc<KyroMem>) -> Self {
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let mem = Arc::clone(mem);
            let handle = thread::Builder::new()
                .name(format!("kyromem-{}-{idx}", pool.as_str()))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job(&mem);
                    }
                })
                .expect("failed to spawn kyromem worker");
            handles.push(handle);
        }

        Self {
            pool,
            tx: Some(tx),
            workers: handles,
            queue_capacity,
        }
    }

    fn try_submit(&self, job: Job) -> Result<(), ExecutionError> {
        let Some(tx) = &self.tx else {
            return Err(self.disconnected());
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                pool: self.pool.as_str().to_string(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> ExecutionError {
        ExecutionError::Disconnected {
            pool: self.pool.as_str().to_string(),
        }
    }

    fn shutdown(&mut self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Handle to a submitted task.
#[must_use = "a task handle does nothing unless joined"]
pub struct TaskHandle<T> {
    pool: Pool,
    rx: Receiver<KyroMemResult<T>>,
    cancel: CancellationToken,
}

impl<T> TaskHandle<T> {
    /// Pool the task was routed to.
    pub const fn pool(&self) -> Pool {
        self.pool
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns the task's own error, or `Disconnected` if the worker went away.
    pub fn join(self) -> KyroMemResult<T> {
        self.rx.recv().map_err(|_| ExecutionError::Disconnected {
            pool: self.pool.as_str().to_string(),
        })?
    }

    /// Waits up to `timeout` for the task to finish.
    ///
    /// On timeout the task is cancelled so it cannot commit afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `Disconnected`, or the task's own error.
    pub fn join_timeout(self, timeout: Duration) -> KyroMemResult<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel.cancel();
                Err(ExecutionError::Timeout {
                    duration_ms: duration_ms(timeout),
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::Disconnected {
                pool: self.pool.as_str().to_string(),
            }
            .into()),
        }
    }
}

/// Bounded two-pool runtime around a shared [`KyroMem`].
pub struct MemRuntime {
    mem: Arc<KyroMem>,
    store: WorkerPool,
    external: WorkerPool,
}

impl std::fmt::Debug for MemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRuntime")
            .field("store_workers", &self.store.workers.len())
            .field("external_workers", &self.external.workers.len())
            .finish_non_exhaustive()
    }
}

impl MemRuntime {
    /// Starts the worker pools.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid configuration.
    pub fn new(mem: Arc<KyroMem>, config: RuntimeConfig) -> KyroMemResult<Self> {
        let config = config.validate()?;
        let store = WorkerPool::start(Pool::Store, config.store_workers, config.queue_capacity, &mem);
        let external = WorkerPool::start(Pool::External, config.external_workers, config.queue_capacity, &mem);
        tracing::info!(
            store_workers = config.store_workers,
            external_workers = config.external_workers,
            queue_capacity = config.queue_capacity,
            "started memory runtime"
        );
        Ok(Self { mem, store, external })
    }

    /// The shared engine.
    #[must_use]
    pub fn mem(&self) -> &Arc<KyroMem> {
        &self.mem
    }

    /// Submits `task` to `pool`.
    ///
    /// The task receives the engine and a context whose token is the one
    /// [`TaskHandle::cancel`] fires; a task cancelled before it starts never runs.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` or `Disconnected` if the task could not be queued.
    pub fn submit<T, F>(&self, pool: Pool, ctx: RequestContext, task: F) -> KyroMemResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&KyroMem, &RequestContext) -> KyroMemResult<T> + Send + 'static,
    {
        let (tx, rx) = bounded::<KyroMemResult<T>>(1);
        let cancel = ctx.cancel.clone();
        let job: Job = Box::new(move |mem: &KyroMem| {
            let result = ctx.cancel.check().and_then(|()| task(mem, &ctx));
            let _ = tx.send(result);
        });

        match pool {
            Pool::Store => self.store.try_submit(job)?,
            Pool::External => self.external.try_submit(job)?,
        }
        Ok(TaskHandle { pool, rx, cancel })
    }

    /// Submits store-only work.
    ///
    /// # Errors
    ///
    /// See [`MemRuntime::submit`].
    pub fn spawn_store<T, F>(&self, ctx: RequestContext, task: F) -> KyroMemResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&KyroMem, &RequestContext) -> KyroMemResult<T> + Send + 'static,
    {
        self.submit(Pool::Store, ctx, task)
    }

    /// Submits work that may call an external provider.
    ///
    /// # Errors
    ///
    /// See [`MemRuntime::submit`].
    pub fn spawn_external<T, F>(&self, ctx: RequestContext, task: F) -> KyroMemResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&KyroMem, &RequestContext) -> KyroMemResult<T> + Send + 'static,
    {
        self.submit(Pool::External, ctx, task)
    }
}

impl Drop for MemRuntime {
    fn drop(&mut self) {
        self.store.shutdown();
        self.external.shutdown();
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `f` on a helper thread and waits at most `timeout` for its result.
///
/// The helper thread is detached on timeout; its eventual result is dropped.
pub(crate) fn call_with_timeout<T, F>(timeout: Duration, f: F) -> Result<T, ExecutionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded::<T>(1);
    thread::Builder::new()
        .name("kyromem-provider-call".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|_| ExecutionError::Disconnected {
            pool: "provider".to_string(),
        })?;

    rx.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => ExecutionError::Timeout {
            duration_ms: duration_ms(timeout),
        },
        RecvTimeoutError::Disconnected => ExecutionError::Disconnected {
            pool: "provider".to_string(),
        },
    })
}
