use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::{Inner, State};
use crate::concurrency::LaunchOptions;
use crate::error::ClusterError;
use crate::events::ClusterEvent;
use crate::job::{Job, TaskFn};
use crate::worker::{WorkResult, Worker};

/// Minimum spacing between two scheduling passes.
const WORK_CALL_INTERVAL_LIMIT: Duration = Duration::from_millis(10);

/// Time given to in-flight retries to be re-queued before the cluster is
/// considered idle.
const IDLE_GRACE: Duration = Duration::from_millis(500);

const LAUNCH_BACKOFF_BASE: Duration = Duration::from_millis(100);
const LAUNCH_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Consecutive launch failures after which queued jobs are failed while
/// the pool has no worker at all.
const MAX_LAUNCH_FAILURES: u32 = 5;

/// What a scheduling pass decided to do, computed under the state lock and
/// carried out after releasing it.
enum Step<D, R, P> {
    Nothing,
    Idle,
    Again,
    Duplicate(Job<D, R, P>),
    Launch {
        worker_id: usize,
        options: Option<LaunchOptions>,
    },
    Dispatch(Dispatch<D, R, P>),
}

struct Dispatch<D, R, P> {
    worker: Arc<Worker<P>>,
    job: Job<D, R, P>,
    task: Option<TaskFn<D, R, P>>,
    /// Another worker could pick up work right away.
    pipeline: bool,
}

/// How a finished attempt affects the job.
enum Followup {
    Done,
    Retry(Option<Instant>),
    Failed,
}

impl<D, R, P> Inner<D, R, P>
where
    D: Serialize + Clone + Send + Sync + 'static,
    R: Send + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Schedule a pass soon. Calls are coalesced so passes run at most once
    /// per [`WORK_CALL_INTERVAL_LIMIT`].
    pub(super) fn work(self: &Arc<Self>) {
        let delay = {
            let mut state = self.lock_state();
            if state.closed || state.work_call_pending {
                return;
            }
            let now = Instant::now();
            state.next_work_call = (state.next_work_call + WORK_CALL_INTERVAL_LIMIT).max(now);
            state.work_call_pending = true;
            state.next_work_call - now
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.lock_state().work_call_pending = false;
            inner.do_work().await;
        });
    }

    async fn do_work(self: Arc<Self>) {
        let step = {
            let mut state = self.lock_state();
            self.next_step(&mut state)
        };

        match step {
            Step::Nothing => {}
            Step::Idle => self.schedule_idle_check(),
            Step::Again => self.work(),
            Step::Duplicate(mut job) => {
                let url = job.url().unwrap_or_default().to_string();
                tracing::debug!(%url, "Skipping duplicate URL");
                if let Some(callback) = job.callback.take() {
                    let _ = callback.send(Err(ClusterError::Duplicate(url)));
                }
                self.work();
            }
            Step::Launch { worker_id, options } => {
                self.launch_worker(worker_id, options).await;
                self.work();
            }
            Step::Dispatch(dispatch) => self.dispatch(dispatch).await,
        }
    }

    fn next_step(&self, state: &mut State<D, R, P>) -> Step<D, R, P> {
        if state.closed {
            return Step::Nothing;
        }

        if state.queue.is_empty() {
            if state.busy.is_empty() && !state.idle_check_pending {
                state.idle_check_pending = true;
                return Step::Idle;
            }
            return Step::Nothing;
        }

        let now = Instant::now();
        let Some(worker) = state.avail.front().cloned() else {
            if self.allowed_to_start_worker(state, now) {
                state.last_launch = Some(now);
                let worker_id = state.next_worker_id;
                state.next_worker_id += 1;
                state.starting.push(worker_id);
                return Step::Launch {
                    worker_id,
                    options: state.per_browser_options.pop_front(),
                };
            }
            return Step::Nothing;
        };

        // Everything left may be delayed.
        let Some(job) = state.queue.shift_at(now) else {
            return Step::Nothing;
        };

        let url = job.url().map(str::to_string);
        let domain = job.domain().map(str::to_string);

        if self.options.skip_duplicate_urls && job.tries() == 0 {
            if let Some(url) = &url {
                if state.duplicate_urls.contains(url) {
                    return Step::Duplicate(job);
                }
            }
        }

        let same_domain_delay = self.options.same_domain_delay;
        if !same_domain_delay.is_zero() {
            if let Some(last) = domain
                .as_ref()
                .and_then(|domain| state.last_domain_access.get(domain))
            {
                let ready_at = *last + same_domain_delay;
                if ready_at > now {
                    state.queue.push(job, Some(ready_at));
                    return Step::Again;
                }
            }
        }

        if self.options.skip_duplicate_urls {
            if let Some(url) = url {
                state.duplicate_urls.insert(url);
            }
        }
        if !same_domain_delay.is_zero() {
            if let Some(domain) = domain {
                state.last_domain_access.insert(domain, now);
            }
        }

        state.avail.pop_front();
        state.busy.push(Arc::clone(&worker));
        let pipeline = !state.avail.is_empty() || self.allowed_to_start_worker(state, now);

        let task = job.task.clone().or_else(|| state.default_task.clone());
        Step::Dispatch(Dispatch {
            worker,
            job,
            task,
            pipeline,
        })
    }

    /// Pool growth gate: below `max_concurrency` (counting launches in
    /// flight), past the creation delay, and not backing off after a failed
    /// launch.
    fn allowed_to_start_worker(&self, state: &State<D, R, P>, now: Instant) -> bool {
        let max = self.options.max_concurrency;
        let count = state.workers.len() + state.starting.len();
        let below_limit = max == 0 || count < max;

        let delay = self.options.worker_creation_delay;
        let spaced = delay.is_zero() || state.last_launch.is_none_or(|at| at + delay <= now);

        let backed_off = state.launch_retry_at.is_none_or(|at| at <= now);

        below_limit && spaced && backed_off
    }

    async fn launch_worker(&self, worker_id: usize, options: Option<LaunchOptions>) {
        tracing::debug!(worker_id, "Launching worker");
        match self.strategy.worker_instance(options.clone()).await {
            Ok(instance) => {
                let worker = Arc::new(Worker::new(worker_id, instance));
                let admitted = {
                    let mut state = self.lock_state();
                    state.starting.retain(|&id| id != worker_id);
                    state.launch_failures = 0;
                    state.launch_retry_at = None;
                    if state.closed {
                        false
                    } else {
                        state.workers.push(Arc::clone(&worker));
                        state.avail.push_back(Arc::clone(&worker));
                        true
                    }
                };

                if admitted {
                    self.reporter()
                        .report(ClusterEvent::WorkerLaunched { worker_id });
                } else {
                    // Closed while the browser was starting.
                    worker.close().await;
                }
            }
            Err(e) => {
                let message = e.to_string();
                let (consecutive_failures, abandoned) = {
                    let mut state = self.lock_state();
                    state.starting.retain(|&id| id != worker_id);
                    state.launch_failures += 1;
                    state.launch_retry_at =
                        Some(Instant::now() + launch_backoff(state.launch_failures));
                    if let Some(options) = options {
                        state.per_browser_options.push_front(options);
                    }
                    let failures = state.launch_failures;

                    // Nothing can ever run the queued jobs: fail them instead
                    // of waiting forever.
                    let stranded = state.workers.is_empty() && state.starting.is_empty();
                    let abandoned: Vec<_> = if failures >= MAX_LAUNCH_FAILURES && stranded {
                        state.launch_failures = 0;
                        let abandoned: Vec<_> = state.queue.drain().collect();
                        state.error_count += abandoned.len();
                        abandoned
                    } else {
                        Vec::new()
                    };
                    (failures, abandoned)
                };

                let error = ClusterError::WorkerLaunch(message.clone());
                self.reporter().report(ClusterEvent::WorkerLaunchFailed {
                    worker_id,
                    error: &error,
                    consecutive_failures,
                });

                if !abandoned.is_empty() {
                    tracing::warn!(
                        jobs = abandoned.len(),
                        consecutive_failures,
                        "No worker could be launched, failing queued jobs"
                    );
                }
                for job in abandoned {
                    self.abandon(job, &message);
                }
            }
        }
    }

    /// Fail a job that never reached a worker.
    fn abandon(&self, mut job: Job<D, R, P>, message: &str) {
        let error = ClusterError::WorkerLaunch(message.to_string());
        if let Some(callback) = job.callback.take() {
            let _ = callback.send(Err(error));
            return;
        }
        job.add_error(error);
        if let Some(error) = job.last_error() {
            self.reporter().report(ClusterEvent::TaskError {
                error,
                data: job.data(),
                url: job.url(),
                will_retry: false,
            });
        }
    }

    async fn dispatch(self: &Arc<Self>, dispatch: Dispatch<D, R, P>) {
        let Dispatch {
            worker,
            job,
            task,
            pipeline,
        } = dispatch;

        if pipeline {
            self.work();
        }

        let result = match task {
            Some(task) => match worker.handle(task, &job, self.options.timeout).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(
                        worker_id = worker.id(),
                        url = ?job.url(),
                        error = %e,
                        "Unable to get a page for job"
                    );
                    WorkResult::Error(e)
                }
            },
            None => WorkResult::Error(ClusterError::NoTaskFunction),
        };

        self.complete(&worker, job, result);
        self.work();
    }

    /// Route the outcome of one attempt and hand the worker back.
    fn complete(&self, worker: &Arc<Worker<P>>, mut job: Job<D, R, P>, result: WorkResult<R>) {
        let followup = match result {
            WorkResult::Success(data) => {
                if let Some(callback) = job.callback.take() {
                    let _ = callback.send(Ok(data));
                }
                Followup::Done
            }
            WorkResult::Closed => {
                if let Some(callback) = job.callback.take() {
                    let _ = callback.send(Err(ClusterError::Closed));
                }
                Followup::Done
            }
            WorkResult::Error(error) => {
                if let Some(callback) = job.callback.take() {
                    // Awaited submissions are never retried.
                    self.lock_state().error_count += 1;
                    let _ = callback.send(Err(error));
                    Followup::Done
                } else {
                    job.add_error(error);
                    let will_retry = job.tries() <= self.options.retry_limit;
                    if let Some(error) = job.last_error() {
                        self.reporter().report(ClusterEvent::TaskError {
                            error,
                            data: job.data(),
                            url: job.url(),
                            will_retry,
                        });
                    }
                    if will_retry {
                        let delay = self.options.retry_delay;
                        Followup::Retry((!delay.is_zero()).then(|| Instant::now() + delay))
                    } else {
                        Followup::Failed
                    }
                }
            }
        };

        let data = job.data().cloned();
        let waiters = {
            let mut state = self.lock_state();
            match followup {
                Followup::Retry(delay_until) if !state.closed => {
                    state.queue.push(job, delay_until);
                }
                Followup::Failed => state.error_count += 1,
                _ => {}
            }
            state.busy.retain(|busy| busy.id() != worker.id());
            state.avail.push_back(Arc::clone(worker));
            std::mem::take(&mut state.completion_waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(data.clone());
        }
    }

    /// Resolve idle waiters once the cluster stayed idle through the grace
    /// window.
    fn schedule_idle_check(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_GRACE).await;
            let (waiters, notify) = {
                let mut state = inner.lock_state();
                state.idle_check_pending = false;
                let idle = state.queue.is_empty() && state.busy.is_empty();
                if state.closed || !idle || state.done_targets() == 0 {
                    return;
                }
                let notify = !state.idle_notified;
                state.idle_notified = true;
                (std::mem::take(&mut state.idle_waiters), notify)
            };

            for waiter in waiters {
                let _ = waiter.send(());
            }
            if notify {
                inner.reporter().report(ClusterEvent::Idle);
            }
        });
    }
}

/// Exponential backoff after consecutive worker launch failures.
fn launch_backoff(failures: u32) -> Duration {
    let factor = 1u32
        .checked_shl(failures.saturating_sub(1))
        .unwrap_or(u32::MAX);
    LAUNCH_BACKOFF_BASE
        .saturating_mul(factor)
        .min(LAUNCH_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_backoff_grows_and_caps() {
        assert_eq!(launch_backoff(1), Duration::from_millis(100));
        assert_eq!(launch_backoff(2), Duration::from_millis(200));
        assert_eq!(launch_backoff(4), Duration::from_millis(800));
        assert_eq!(launch_backoff(10), LAUNCH_BACKOFF_MAX);
        assert_eq!(launch_backoff(64), LAUNCH_BACKOFF_MAX);
    }
}
