use std::time::Duration;

use thiserror::Error;

/// Error types for Corral clusters.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Invalid cluster configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The concurrency implementation failed to initialize.
    #[error("Unable to launch browser, error message: {0}")]
    Launch(String),

    /// A new pool slot could not get its browser.
    #[error("Unable to launch browser for worker, error message: {0}")]
    WorkerLaunch(String),

    /// A worker could not obtain a job instance within its retry ceiling.
    #[error("Unable to get browser page after {attempts} attempts: {source}")]
    Acquire {
        attempts: u32,
        #[source]
        source: Box<ClusterError>,
    },

    /// Creating or releasing a page/context failed.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Creating or releasing a page/context did not finish in time.
    #[error("Resource operation timed out after {}ms", .0.as_millis())]
    ResourceTimeout(Duration),

    /// The task function did not finish within the job timeout.
    #[error("Timeout hit: {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The task function returned an error (or panicked).
    #[error("{0}")]
    Task(#[source] anyhow::Error),

    /// Neither the job nor the cluster has a task function.
    #[error("No task function defined")]
    NoTaskFunction,

    /// The job's URL was already dispatched and duplicate skipping is on.
    #[error("Skipped duplicate URL: {0}")]
    Duplicate(String),

    /// The cluster or worker was closed before the job could finish.
    #[error("Cluster closed")]
    Closed,

    /// Underlying browser engine error.
    #[error("Browser error: {0}")]
    Browser(String),
}

impl ClusterError {
    /// Returns true if this error points at a broken shared browser or
    /// context that should be relaunched.
    pub fn should_repair(&self) -> bool {
        match self {
            ClusterError::Resource(_)
            | ClusterError::ResourceTimeout(_)
            | ClusterError::Browser(_) => true,
            ClusterError::Acquire { source, .. } => source.should_repair(),
            _ => false,
        }
    }
}
