use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::concurrency::{JobInstance, WorkerInstance};
use crate::error::ClusterError;
use crate::job::{Job, TaskArgs, TaskFn, WorkerRef};

/// How many times a worker tries to obtain a job instance before giving up.
pub const BROWSER_INSTANCE_TRIES: u32 = 5;

/// Outcome of running one job on a worker.
#[derive(Debug)]
pub enum WorkResult<R> {
    Success(R),
    /// The task failed or timed out.
    Error(ClusterError),
    /// The worker was closed before a page could be obtained.
    Closed,
}

/// The job a worker is currently busy with.
#[derive(Debug, Clone)]
pub struct ActiveTarget {
    pub url: Option<String>,
    pub since: Instant,
}

/// One pool slot bound to a live [`WorkerInstance`].
pub struct Worker<P> {
    id: usize,
    instance: Box<dyn WorkerInstance<P>>,
    closed: AtomicBool,
    active_target: Mutex<Option<ActiveTarget>>,
}

impl<P> Worker<P> {
    pub fn new(id: usize, instance: Box<dyn WorkerInstance<P>>) -> Self {
        tracing::debug!(worker_id = id, "Starting worker");
        Self {
            id,
            instance,
            closed: AtomicBool::new(false),
            active_target: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active_target(&self) -> Option<ActiveTarget> {
        self.lock_target().clone()
    }

    fn lock_target(&self) -> MutexGuard<'_, Option<ActiveTarget>> {
        self.active_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Relaunch the underlying browser if `error` points at a broken one.
    /// A closed worker never relaunches anything.
    async fn repair_after(&self, error: &ClusterError) {
        if self.is_closed() || !error.should_repair() {
            return;
        }
        if let Err(e) = self.instance.repair().await {
            tracing::warn!(worker_id = self.id, error = %e, "Repair failed");
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Worker<P> {
    /// Run `task` for `job` on a fresh job instance.
    ///
    /// Task errors and timeouts come back as [`WorkResult::Error`]. Only
    /// failing to obtain a job instance [`BROWSER_INSTANCE_TRIES`] times in a
    /// row is returned as `Err`. A `timeout` of zero disables the ceiling.
    pub async fn handle<D, R>(
        &self,
        task: TaskFn<D, R, P>,
        job: &Job<D, R, P>,
        timeout: Duration,
    ) -> Result<WorkResult<R>, ClusterError>
    where
        D: Clone + Send + 'static,
        R: Send + 'static,
    {
        *self.lock_target() = Some(ActiveTarget {
            url: job.url().map(str::to_string),
            since: Instant::now(),
        });
        let result = self.run(task, job, timeout).await;
        *self.lock_target() = None;
        result
    }

    async fn run<D, R>(
        &self,
        task: TaskFn<D, R, P>,
        job: &Job<D, R, P>,
        timeout: Duration,
    ) -> Result<WorkResult<R>, ClusterError>
    where
        D: Clone + Send + 'static,
        R: Send + 'static,
    {
        let Some(mut instance) = self.acquire().await? else {
            return Ok(WorkResult::Closed);
        };

        tracing::debug!(worker_id = self.id, url = ?job.url(), "Executing task");

        let args = TaskArgs {
            page: instance.page().clone(),
            data: job.data().cloned(),
            worker: WorkerRef { id: self.id },
        };
        let outcome = execute(task, args, timeout).await;

        tracing::debug!(worker_id = self.id, "Finished executing task");

        if let Err(e) = instance.close().await {
            tracing::debug!(
                worker_id = self.id,
                url = ?job.url(),
                error = %e,
                "Error closing browser instance"
            );
            self.repair_after(&e).await;
        }

        Ok(match outcome {
            Ok(data) => WorkResult::Success(data),
            Err(e) => {
                tracing::info!(worker_id = self.id, url = ?job.url(), error = %e, "Error crawling");
                WorkResult::Error(e)
            }
        })
    }

    /// Obtain a job instance, repairing a broken browser between failed
    /// attempts. `Ok(None)` means the worker was closed while waiting.
    async fn acquire(&self) -> Result<Option<Box<dyn JobInstance<P>>>, ClusterError> {
        let mut tries = 0;
        while !self.is_closed() {
            match self.instance.job_instance().await {
                Ok(instance) => return Ok(Some(instance)),
                Err(e) => {
                    tries += 1;
                    tracing::debug!(
                        worker_id = self.id,
                        tries,
                        error = %e,
                        "Error getting browser page"
                    );
                    if tries >= BROWSER_INSTANCE_TRIES {
                        return Err(ClusterError::Acquire {
                            attempts: tries,
                            source: Box::new(e),
                        });
                    }
                    self.repair_after(&e).await;
                }
            }
        }
        Ok(None)
    }

    /// Mark the worker closed and release its instance. Never fails.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.instance.close().await {
            tracing::debug!(worker_id = self.id, error = %e, "Unable to close worker browser");
        }
        tracing::debug!(worker_id = self.id, "Closed worker");
    }
}

/// Run the task in its own tokio task so a panic surfaces as an error.
async fn execute<D, R, P>(
    task: TaskFn<D, R, P>,
    args: TaskArgs<D, P>,
    timeout: Duration,
) -> Result<R, ClusterError>
where
    D: Send + 'static,
    R: Send + 'static,
    P: Send + 'static,
{
    let mut handle = tokio::spawn(task(args));

    let joined = if timeout.is_zero() {
        (&mut handle).await
    } else {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(ClusterError::Timeout(timeout));
            }
        }
    };

    match joined {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(ClusterError::Task(e)),
        Err(join_error) => Err(ClusterError::Task(anyhow::anyhow!(
            "task panicked: {join_error}"
        ))),
    }
}
