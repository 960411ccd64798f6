use std::str::FromStr;
use std::time::Duration;

use crate::concurrency::{Concurrency, LaunchOptions};
use crate::error::ClusterError;

/// Configuration for a [`crate::Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Built-in strategy used by [`crate::Cluster::launch`].
    pub concurrency: Concurrency,

    /// Maximum number of workers. `0` means unlimited.
    pub max_concurrency: usize,

    /// Minimum spacing between two worker launches.
    pub worker_creation_delay: Duration,

    /// Launch options shared by every browser the strategy starts.
    pub launch_options: LaunchOptions,

    /// Per-slot launch overrides, handed out in order as workers start.
    /// Length must equal `max_concurrency`.
    pub per_browser_options: Option<Vec<LaunchOptions>>,

    /// Ceiling for a single task execution. Zero disables it.
    pub timeout: Duration,

    /// Extra attempts for failing fire-and-forget jobs.
    pub retry_limit: u32,

    /// Delay before a failed job becomes ready again.
    pub retry_delay: Duration,

    /// Drop fresh jobs whose URL has already been dispatched.
    pub skip_duplicate_urls: bool,

    /// Minimum spacing between two jobs on the same domain. Zero disables it.
    pub same_domain_delay: Duration,

    /// Render a periodic status block on stderr.
    pub monitor: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Context,
            max_concurrency: 1,
            worker_creation_delay: Duration::ZERO,
            launch_options: LaunchOptions::default(),
            per_browser_options: None,
            timeout: Duration::from_secs(30),
            retry_limit: 0,
            retry_delay: Duration::ZERO,
            skip_duplicate_urls: false,
            same_domain_delay: Duration::ZERO,
            monitor: false,
        }
    }
}

impl ClusterOptions {
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_worker_creation_delay(mut self, delay: Duration) -> Self {
        self.worker_creation_delay = delay;
        self
    }

    pub fn with_launch_options(mut self, options: LaunchOptions) -> Self {
        self.launch_options = options;
        self
    }

    pub fn with_per_browser_options(mut self, options: Vec<LaunchOptions>) -> Self {
        self.per_browser_options = Some(options);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_delay = delay;
        self
    }

    pub fn with_skip_duplicate_urls(mut self, skip: bool) -> Self {
        self.skip_duplicate_urls = skip;
        self
    }

    pub fn with_same_domain_delay(mut self, delay: Duration) -> Self {
        self.same_domain_delay = delay;
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    /// Check option combinations that cannot be expressed by the types.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if let Some(per_browser) = &self.per_browser_options {
            if per_browser.len() != self.max_concurrency {
                return Err(ClusterError::Config(format!(
                    "perBrowserOptions length must equal maxConcurrency ({} != {})",
                    per_browser.len(),
                    self.max_concurrency
                )));
            }
        }
        Ok(())
    }

    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `CORRAL_CONCURRENCY` (`page`, `context` or `browser`)
    /// - `CORRAL_MAX_CONCURRENCY`
    /// - `CORRAL_WORKER_CREATION_DELAY_MS`
    /// - `CORRAL_TIMEOUT_MS`
    /// - `CORRAL_RETRY_LIMIT`
    /// - `CORRAL_RETRY_DELAY_MS`
    /// - `CORRAL_SKIP_DUPLICATE_URLS`
    /// - `CORRAL_SAME_DOMAIN_DELAY_MS`
    /// - `CORRAL_MONITOR`
    pub fn from_env() -> Result<Self, ClusterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClusterOptions::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClusterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(raw) = lookup("CORRAL_CONCURRENCY") {
            options.concurrency = raw.parse().map_err(ClusterError::Config)?;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "CORRAL_MAX_CONCURRENCY")? {
            options.max_concurrency = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CORRAL_WORKER_CREATION_DELAY_MS")? {
            options.worker_creation_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CORRAL_TIMEOUT_MS")? {
            options.timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<u32>(&lookup, "CORRAL_RETRY_LIMIT")? {
            options.retry_limit = limit;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CORRAL_RETRY_DELAY_MS")? {
            options.retry_delay = Duration::from_millis(ms);
        }
        if let Some(skip) = parse_flag(&lookup, "CORRAL_SKIP_DUPLICATE_URLS")? {
            options.skip_duplicate_urls = skip;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CORRAL_SAME_DOMAIN_DELAY_MS")? {
            options.same_domain_delay = Duration::from_millis(ms);
        }
        if let Some(monitor) = parse_flag(&lookup, "CORRAL_MONITOR")? {
            options.monitor = monitor;
        }

        Ok(options)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ClusterError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ClusterError::Config(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ClusterError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ClusterError::Config(format!(
                "Invalid {key} '{raw}': must be true or false"
            ))),
        },
    }
}
