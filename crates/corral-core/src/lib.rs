pub mod cluster;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod monitor;
pub mod queue;
pub mod util;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use cluster::{Cluster, ClusterStatus, WorkerState, WorkerStatus};
pub use concurrency::{
    BrowserDriver, Concurrency, ConcurrencyImplementation, JobInstance, LaunchOptions,
    WorkerInstance,
};
pub use config::ClusterOptions;
pub use error::ClusterError;
pub use events::{ClusterEvent, ClusterReporter, TracingClusterReporter};
pub use job::{Job, TaskArgs, TaskFn, WorkerRef, task};
pub use queue::DelayedQueue;
pub use worker::{WorkResult, Worker};
