use crate::error::ClusterError;

/// Notifications emitted by a [`crate::Cluster`].
#[derive(Debug)]
pub enum ClusterEvent<'a, D> {
    /// A job was submitted.
    Queued {
        data: Option<&'a D>,
        url: Option<&'a str>,
        has_task: bool,
    },
    /// A fire-and-forget job failed.
    TaskError {
        error: &'a ClusterError,
        data: Option<&'a D>,
        url: Option<&'a str>,
        will_retry: bool,
    },
    /// The queue drained and no worker is busy.
    Idle,
    WorkerLaunched {
        worker_id: usize,
    },
    /// A new pool slot could not get its browser. The launch is retried.
    WorkerLaunchFailed {
        worker_id: usize,
        error: &'a ClusterError,
        consecutive_failures: u32,
    },
}

/// Observer for cluster notifications.
///
/// Reports are delivered synchronously from the scheduling loop, so
/// implementations should return quickly.
pub trait ClusterReporter<D>: Send + Sync {
    fn report(&self, event: ClusterEvent<'_, D>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingClusterReporter;

impl<D> ClusterReporter<D> for TracingClusterReporter {
    fn report(&self, event: ClusterEvent<'_, D>) {
        match event {
            ClusterEvent::Queued { url, has_task, .. } => {
                tracing::debug!(?url, %has_task, "Job queued");
            }
            ClusterEvent::TaskError {
                error,
                url,
                will_retry,
                ..
            } => {
                tracing::warn!(?url, %error, %will_retry, "Task failed");
            }
            ClusterEvent::Idle => {
                tracing::info!("Cluster idle");
            }
            ClusterEvent::WorkerLaunched { worker_id } => {
                tracing::info!(worker_id, "Worker launched");
            }
            ClusterEvent::WorkerLaunchFailed {
                worker_id,
                error,
                consecutive_failures,
            } => {
                tracing::error!(
                    worker_id,
                    %error,
                    consecutive_failures,
                    "Worker launch failed"
                );
            }
        }
    }
}
