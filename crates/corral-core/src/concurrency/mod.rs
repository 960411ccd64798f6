//! Resource-acquisition strategies.
//!
//! A [`ConcurrencyImplementation`] decides how browsers, contexts and pages
//! are created for the pool. It mints one [`WorkerInstance`] per pool slot,
//! and each worker instance mints one [`JobInstance`] per job:
//!
//! ```text
//! ConcurrencyImplementation --(per slot)--> WorkerInstance --(per job)--> JobInstance
//! ```
//!
//! Three built-in strategies are provided, written once against the
//! [`BrowserDriver`] seam:
//!
//! | strategy | shared | per job |
//! |---|---|---|
//! | [`PageConcurrency`] | browser + context | page |
//! | [`ContextConcurrency`] | browser | context + page |
//! | [`BrowserConcurrency`] | nothing (browser per slot) | context + page |
//!
//! Custom strategies implement [`ConcurrencyImplementation`] directly and are
//! passed to [`crate::Cluster::launch_with`].

mod browser;
mod context;
mod driver;
mod page;
mod single_browser;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

pub use browser::BrowserConcurrency;
pub use context::{ContextConcurrency, IsolatedContext};
pub use driver::BrowserDriver;
pub use page::{PageConcurrency, SharedContext};
pub use single_browser::{ResourceAllocator, Resources, SingleBrowserImplementation};

/// Ceiling for creating or releasing a page/context, independent of the
/// job timeout.
pub const RESOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options used to launch a browser process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Explicit browser binary; `None` lets the driver locate one.
    pub executable: Option<PathBuf>,
    /// Extra command line arguments.
    pub args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
    pub window_size: Option<(u32, u32)>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            args: Vec::new(),
            user_data_dir: None,
            window_size: None,
        }
    }
}

/// Built-in strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// One shared browser and context; a new page per job.
    Page,
    /// One shared browser; a new context per job.
    Context,
    /// One browser per pool slot.
    Browser,
}

impl Concurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Concurrency::Page => "page",
            Concurrency::Context => "context",
            Concurrency::Browser => "browser",
        }
    }

    /// Build the matching built-in strategy on top of `driver`.
    pub fn build<B: BrowserDriver>(
        self,
        driver: B,
        options: LaunchOptions,
    ) -> Arc<dyn ConcurrencyImplementation<B::Page>> {
        match self {
            Concurrency::Page => Arc::new(PageConcurrency::page(driver, options)),
            Concurrency::Context => Arc::new(ContextConcurrency::context(driver, options)),
            Concurrency::Browser => Arc::new(BrowserConcurrency::new(driver, options)),
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Concurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "page" => Ok(Concurrency::Page),
            "context" => Ok(Concurrency::Context),
            "browser" => Ok(Concurrency::Browser),
            _ => Err(format!("Unknown concurrency option: {}", s)),
        }
    }
}

/// Pluggable policy for creating, recycling and repairing browsers.
#[async_trait]
pub trait ConcurrencyImplementation<P>: Send + Sync {
    /// Prepare shared resources. Failure aborts cluster startup.
    async fn init(&self) -> Result<(), ClusterError>;

    /// Release shared resources. Called once when the cluster shuts down.
    async fn close(&self) -> Result<(), ClusterError>;

    /// Create the long-lived instance backing one pool slot.
    async fn worker_instance(
        &self,
        options: Option<LaunchOptions>,
    ) -> Result<Box<dyn WorkerInstance<P>>, ClusterError>;
}

/// Per-slot resource provider owned by exactly one worker.
#[async_trait]
pub trait WorkerInstance<P>: Send + Sync {
    /// Create the resources for a single job. May fail while the
    /// underlying browser is broken.
    async fn job_instance(&self) -> Result<Box<dyn JobInstance<P>>, ClusterError>;

    async fn close(&self) -> Result<(), ClusterError>;

    /// Discard and relaunch the underlying browser. Idempotent.
    async fn repair(&self) -> Result<(), ClusterError>;
}

/// Resources for exactly one job. Must be closed after use.
#[async_trait]
pub trait JobInstance<P>: Send + Sync {
    fn page(&self) -> &P;

    async fn close(&mut self) -> Result<(), ClusterError>;
}

/// Run a resource operation under [`RESOURCE_TIMEOUT`].
pub(crate) async fn with_resource_timeout<T, F>(operation: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(RESOURCE_TIMEOUT, operation).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::ResourceTimeout(RESOURCE_TIMEOUT)),
    }
}
