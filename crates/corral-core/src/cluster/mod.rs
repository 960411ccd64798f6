//! The scheduler.
//!
//! A [`Cluster`] owns the job queue, the worker pool and the resource
//! strategy. Every submission triggers a scheduling pass (see
//! `scheduling.rs`) that matches ready jobs to available workers, grows the
//! pool when allowed, and applies the duplicate and same-domain policies.
//!
//! All scheduler state sits behind one mutex that is only held for short,
//! non-async sections. Browser launches, task execution and resource
//! release happen outside of it.

mod scheduling;
mod status;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::concurrency::{BrowserDriver, ConcurrencyImplementation, LaunchOptions};
use crate::config::ClusterOptions;
use crate::error::ClusterError;
use crate::events::{ClusterEvent, ClusterReporter, TracingClusterReporter};
use crate::job::{Job, TaskFn};
use crate::monitor::{self, Display, LoadSample, SystemMonitor};
use crate::queue::DelayedQueue;
use crate::worker::Worker;

pub use status::{ClusterStatus, WorkerState, WorkerStatus};
use status::Counters;

const MONITORING_DISPLAY_INTERVAL: Duration = Duration::from_millis(500);
const CHECK_FOR_WORK_INTERVAL: Duration = Duration::from_millis(100);

/// Pool of browser workers processing a shared job queue.
///
/// `D` is the job payload, `R` the task result and `P` the page handle of
/// the browser driver. Cloning is cheap and every clone drives the same
/// cluster, so task functions may hold one to enqueue follow-up work.
pub struct Cluster<D, R, P> {
    inner: Arc<Inner<D, R, P>>,
}

impl<D, R, P> Clone for Cluster<D, R, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<D, R, P> {
    options: ClusterOptions,
    strategy: Arc<dyn ConcurrencyImplementation<P>>,
    state: Mutex<State<D, R, P>>,
    reporter: RwLock<Arc<dyn ClusterReporter<D>>>,
    cancel: CancellationToken,
    started_at: DateTime<Local>,
    started: Instant,
    system_monitor: Option<SystemMonitor>,
    display: Mutex<Option<Display>>,
}

struct State<D, R, P> {
    queue: DelayedQueue<Job<D, R, P>>,
    default_task: Option<TaskFn<D, R, P>>,

    workers: Vec<Arc<Worker<P>>>,
    avail: VecDeque<Arc<Worker<P>>>,
    busy: Vec<Arc<Worker<P>>>,
    /// Ids reserved by launches in flight.
    starting: Vec<usize>,
    next_worker_id: usize,
    last_launch: Option<Instant>,
    launch_failures: u32,
    launch_retry_at: Option<Instant>,
    per_browser_options: VecDeque<LaunchOptions>,

    all_target_count: usize,
    error_count: usize,

    duplicate_urls: HashSet<String>,
    last_domain_access: HashMap<String, Instant>,

    idle_waiters: Vec<oneshot::Sender<()>>,
    completion_waiters: Vec<oneshot::Sender<Option<D>>>,

    next_work_call: Instant,
    work_call_pending: bool,
    idle_check_pending: bool,
    idle_notified: bool,
    closed: bool,
}

impl<D, R, P> State<D, R, P> {
    /// Jobs that left the queue and are not running anymore.
    fn done_targets(&self) -> usize {
        self.all_target_count
            .saturating_sub(self.queue.len() + self.busy.len())
    }

    fn is_avail(&self, worker: &Worker<P>) -> bool {
        self.avail.iter().any(|w| w.id() == worker.id())
    }
}

impl<D, R, P> Cluster<D, R, P>
where
    D: Serialize + Clone + Send + Sync + 'static,
    R: Send + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Start a cluster on top of one of the built-in strategies selected by
    /// `options.concurrency`.
    pub async fn launch<B>(driver: B, options: ClusterOptions) -> Result<Self, ClusterError>
    where
        B: BrowserDriver<Page = P>,
    {
        options.validate()?;
        let strategy = options
            .concurrency
            .build(driver, options.launch_options.clone());
        Self::launch_with(strategy, options).await
    }

    /// Start a cluster on top of a custom strategy. `options.concurrency`
    /// is ignored.
    pub async fn launch_with(
        strategy: Arc<dyn ConcurrencyImplementation<P>>,
        options: ClusterOptions,
    ) -> Result<Self, ClusterError> {
        tracing::debug!(
            max_concurrency = options.max_concurrency,
            "Launching cluster"
        );
        options.validate()?;

        strategy.init().await.map_err(|e| match e {
            ClusterError::Launch(_) => e,
            other => ClusterError::Launch(other.to_string()),
        })?;

        let system_monitor = if options.monitor {
            Some(SystemMonitor::start().await)
        } else {
            None
        };

        let per_browser_options = options
            .per_browser_options
            .clone()
            .map(VecDeque::from)
            .unwrap_or_default();

        let now = Instant::now();
        let inner = Arc::new(Inner {
            strategy,
            state: Mutex::new(State {
                queue: DelayedQueue::new(),
                default_task: None,
                workers: Vec::new(),
                avail: VecDeque::new(),
                busy: Vec::new(),
                starting: Vec::new(),
                next_worker_id: 0,
                last_launch: None,
                launch_failures: 0,
                launch_retry_at: None,
                per_browser_options,
                all_target_count: 0,
                error_count: 0,
                duplicate_urls: HashSet::new(),
                last_domain_access: HashMap::new(),
                idle_waiters: Vec::new(),
                completion_waiters: Vec::new(),
                next_work_call: now,
                work_call_pending: false,
                idle_check_pending: false,
                idle_notified: false,
                closed: false,
            }),
            reporter: RwLock::new(Arc::new(TracingClusterReporter)),
            cancel: CancellationToken::new(),
            started_at: Local::now(),
            started: now,
            system_monitor,
            display: Mutex::new(None),
            options,
        });

        spawn_ticker(&inner, CHECK_FOR_WORK_INTERVAL, |inner| inner.work());
        if inner.options.monitor {
            spawn_ticker(&inner, MONITORING_DISPLAY_INTERVAL, |inner| {
                inner.render_monitor()
            });
        }

        Ok(Self { inner })
    }

    /// Replace the reporter notified of cluster events. Defaults to
    /// [`TracingClusterReporter`].
    pub fn set_reporter(&self, reporter: Arc<dyn ClusterReporter<D>>) {
        *self
            .inner
            .reporter
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reporter;
    }

    /// Set the task function used by jobs submitted without one.
    pub fn task(&self, task: TaskFn<D, R, P>) {
        self.inner.lock_state().default_task = Some(task);
    }

    /// Submit a payload for the default task without waiting for it.
    pub fn queue(&self, data: D) {
        self.inner.submit(Job::new(Some(data), None, None));
    }

    /// Submit a payload with its own task function without waiting for it.
    pub fn queue_with(&self, data: D, task: TaskFn<D, R, P>) {
        self.inner.submit(Job::new(Some(data), Some(task), None));
    }

    /// Submit a task function without payload.
    pub fn queue_fn(&self, task: TaskFn<D, R, P>) {
        self.inner.submit(Job::new(None, Some(task), None));
    }

    /// Run the default task on `data` and wait for its result.
    ///
    /// Failures are returned directly and never retried.
    pub async fn execute(&self, data: D) -> Result<R, ClusterError> {
        self.submit_and_wait(Some(data), None).await
    }

    pub async fn execute_with(&self, data: D, task: TaskFn<D, R, P>) -> Result<R, ClusterError> {
        self.submit_and_wait(Some(data), Some(task)).await
    }

    pub async fn execute_fn(&self, task: TaskFn<D, R, P>) -> Result<R, ClusterError> {
        self.submit_and_wait(None, Some(task)).await
    }

    async fn submit_and_wait(
        &self,
        data: Option<D>,
        task: Option<TaskFn<D, R, P>>,
    ) -> Result<R, ClusterError> {
        let (tx, rx) = oneshot::channel();
        self.inner.submit(Job::new(data, task, Some(tx)));
        rx.await.unwrap_or(Err(ClusterError::Closed))
    }

    /// Wait until the queue is empty and no worker is busy.
    ///
    /// Only resolves once at least one job has finished. Returns immediately
    /// on a closed cluster.
    pub async fn idle(&self) {
        let rx = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.idle_waiters.push(tx);
            rx
        };
        self.inner.work();
        let _ = rx.await;
    }

    /// Wait for the next job to finish and return its payload.
    pub async fn wait_for_one(&self) -> Result<Option<D>, ClusterError> {
        let rx = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(ClusterError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            state.completion_waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| ClusterError::Closed)
    }

    /// Shut everything down.
    ///
    /// Jobs still queued are dropped and their `execute` callers receive
    /// [`ClusterError::Closed`]. Never fails; errors are logged.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn status(&self) -> ClusterStatus {
        self.inner.status()
    }
}

impl<D, R, P> Inner<D, R, P>
where
    D: Serialize + Clone + Send + Sync + 'static,
    R: Send + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State<D, R, P>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reporter(&self) -> Arc<dyn ClusterReporter<D>> {
        Arc::clone(
            &self
                .reporter
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn submit(self: &Arc<Self>, job: Job<D, R, P>) {
        self.reporter().report(ClusterEvent::Queued {
            data: job.data(),
            url: job.url(),
            has_task: job.task.is_some(),
        });

        let rejected = {
            let mut state = self.lock_state();
            state.all_target_count += 1;
            if state.closed {
                Some(job)
            } else {
                state.idle_notified = false;
                state.queue.push(job, None);
                None
            }
        };

        if let Some(mut job) = rejected {
            tracing::warn!(url = ?job.url(), "Cluster is closed, dropping job");
            if let Some(callback) = job.callback.take() {
                let _ = callback.send(Err(ClusterError::Closed));
            }
            return;
        }
        self.work();
    }

    async fn close(&self) {
        let (workers, dropped, idle_waiters) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.completion_waiters.clear();
            let dropped: Vec<_> = state.queue.drain().collect();
            (
                state.workers.clone(),
                dropped,
                std::mem::take(&mut state.idle_waiters),
            )
        };
        self.cancel.cancel();

        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropping queued jobs");
        }
        for mut job in dropped {
            if let Some(callback) = job.callback.take() {
                let _ = callback.send(Err(ClusterError::Closed));
            }
        }
        for waiter in idle_waiters {
            let _ = waiter.send(());
        }

        futures::future::join_all(workers.iter().map(|worker| worker.close())).await;

        if let Err(e) = self.strategy.close().await {
            tracing::debug!(error = %e, "Unable to close browser");
        }

        if self.options.monitor {
            self.render_monitor();
            let mut display = self
                .display
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(display) = display.as_mut() {
                if let Err(e) = display.close() {
                    tracing::debug!(error = %e, "Unable to close monitor display");
                }
            }
        }
        if let Some(system_monitor) = &self.system_monitor {
            system_monitor.close();
        }

        tracing::debug!("Closed");
    }

    fn status(&self) -> ClusterStatus {
        let counters = {
            let state = self.lock_state();
            let mut workers: Vec<WorkerStatus> = state
                .workers
                .iter()
                .map(|worker| {
                    if state.is_avail(worker) {
                        WorkerStatus {
                            id: worker.id(),
                            state: WorkerState::Idle,
                            url: String::new(),
                        }
                    } else {
                        let url = worker
                            .active_target()
                            .and_then(|target| target.url)
                            .unwrap_or_else(|| "UNKNOWN TARGET".to_string());
                        WorkerStatus {
                            id: worker.id(),
                            state: WorkerState::Work,
                            url,
                        }
                    }
                })
                .collect();
            workers.extend(state.starting.iter().map(|&id| WorkerStatus {
                id,
                state: WorkerState::Starting,
                url: String::new(),
            }));

            Counters {
                all_target_count: state.all_target_count,
                queued: state.queue.len(),
                busy: state.busy.len(),
                error_count: state.error_count,
                workers,
            }
        };
        ClusterStatus::build(
            counters,
            self.started_at,
            Local::now(),
            self.started.elapsed(),
        )
    }

    fn render_monitor(&self) {
        let Some(system_monitor) = &self.system_monitor else {
            return;
        };
        let status = self.status();
        let load = LoadSample {
            cpu: system_monitor.cpu_usage(),
            memory: system_monitor.memory_usage(),
        };
        let mut display = self
            .display
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let display = display.get_or_insert_with(Display::new);
        if let Err(e) = monitor::render(display, &status, load) {
            tracing::debug!(error = %e, "Unable to render monitor");
        }
    }
}

/// Run `tick` every `period` until the cluster is closed or dropped.
fn spawn_ticker<D, R, P, F>(inner: &Arc<Inner<D, R, P>>, period: Duration, tick: F)
where
    D: Send + Sync + 'static,
    R: Send + 'static,
    P: Send + Sync + 'static,
    F: Fn(&Arc<Inner<D, R, P>>) + Send + 'static,
{
    let weak: Weak<Inner<D, R, P>> = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    tick(&inner);
                }
                () = cancel.cancelled() => break,
            }
        }
    });
}
