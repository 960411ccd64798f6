use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::concurrency::{
    BrowserDriver, ConcurrencyImplementation, JobInstance, LaunchOptions, WorkerInstance,
    with_resource_timeout,
};
use crate::error::ClusterError;

/// Full isolation: every pool slot runs its own browser process, and
/// every job gets a fresh context inside it.
///
/// Per-slot [`LaunchOptions`] (from `per_browser_options`) override the
/// strategy-wide defaults.
pub struct BrowserConcurrency<B: BrowserDriver> {
    driver: Arc<B>,
    options: LaunchOptions,
}

impl<B: BrowserDriver> BrowserConcurrency<B> {
    pub fn new(driver: B, options: LaunchOptions) -> Self {
        Self {
            driver: Arc::new(driver),
            options,
        }
    }
}

#[async_trait]
impl<B: BrowserDriver> ConcurrencyImplementation<B::Page> for BrowserConcurrency<B> {
    async fn init(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn worker_instance(
        &self,
        options: Option<LaunchOptions>,
    ) -> Result<Box<dyn WorkerInstance<B::Page>>, ClusterError> {
        let options = options.unwrap_or_else(|| self.options.clone());
        let browser = self.driver.launch(&options).await?;
        Ok(Box::new(DedicatedBrowser {
            driver: Arc::clone(&self.driver),
            options,
            browser: Mutex::new(Some(Arc::new(browser))),
            closed: AtomicBool::new(false),
        }))
    }
}

struct DedicatedBrowser<B: BrowserDriver> {
    driver: Arc<B>,
    options: LaunchOptions,
    browser: Mutex<Option<Arc<B::Browser>>>,
    closed: AtomicBool,
}

impl<B: BrowserDriver> DedicatedBrowser<B> {
    fn lock_browser(&self) -> MutexGuard<'_, Option<Arc<B::Browser>>> {
        self.browser.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<B: BrowserDriver> WorkerInstance<B::Page> for DedicatedBrowser<B> {
    async fn job_instance(&self) -> Result<Box<dyn JobInstance<B::Page>>, ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::Closed);
        }
        let browser = self
            .lock_browser()
            .clone()
            .ok_or_else(|| ClusterError::Browser("browser is not running".into()))?;

        let driver = &self.driver;
        let (context, page) = with_resource_timeout(async {
            let context = driver.new_context(&browser).await?;
            match driver.new_page(&browser, &context).await {
                Ok(page) => Ok((context, page)),
                Err(e) => {
                    let _ = driver.close_context(&browser, &context).await;
                    Err(e)
                }
            }
        })
        .await?;

        Ok(Box::new(DedicatedJob {
            driver: Arc::clone(&self.driver),
            browser,
            context: Some(context),
            page,
        }))
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.closed.store(true, Ordering::SeqCst);
        let browser = self.lock_browser().take();
        match browser {
            Some(browser) => self.driver.close_browser(&browser).await,
            None => Ok(()),
        }
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Skipping repair, browser is closed");
            return Ok(());
        }
        tracing::debug!("Starting repair");
        let old = self.lock_browser().take();
        if let Some(old) = old {
            // Will probably fail, the browser is likely broken already.
            let _ = self.driver.close_browser(&old).await;
        }

        // Only one job runs per browser, so a plain relaunch is enough.
        let browser = self.driver.launch(&self.options).await.map_err(|e| {
            ClusterError::Launch(format!("Unable to restart browser: {e}"))
        })?;
        if self.closed.load(Ordering::SeqCst) {
            // Closed while relaunching.
            return self.driver.close_browser(&browser).await;
        }
        *self.lock_browser() = Some(Arc::new(browser));
        Ok(())
    }
}

struct DedicatedJob<B: BrowserDriver> {
    driver: Arc<B>,
    browser: Arc<B::Browser>,
    context: Option<B::Context>,
    page: B::Page,
}

#[async_trait]
impl<B: BrowserDriver> JobInstance<B::Page> for DedicatedJob<B> {
    fn page(&self) -> &B::Page {
        &self.page
    }

    async fn close(&mut self) -> Result<(), ClusterError> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        with_resource_timeout(self.driver.close_context(&self.browser, &context)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDriver;

    #[tokio::test]
    async fn each_worker_launches_its_own_browser() {
        let driver = MockDriver::new();
        let strategy = BrowserConcurrency::new(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        assert_eq!(driver.stats().launches, 0);

        let first = strategy.worker_instance(None).await.unwrap();
        let second = strategy.worker_instance(None).await.unwrap();
        assert_eq!(driver.stats().launches, 2);

        let mut a = first.job_instance().await.unwrap();
        let mut b = second.job_instance().await.unwrap();
        assert_ne!(a.page().browser, b.page().browser);
        a.close().await.unwrap();
        b.close().await.unwrap();

        first.close().await.unwrap();
        second.close().await.unwrap();
        let stats = driver.stats();
        assert_eq!(stats.browser_closes, 2);
        assert_eq!(stats.contexts_closed, 2);
    }

    #[tokio::test]
    async fn per_worker_options_override_defaults() {
        let driver = MockDriver::new();
        let strategy = BrowserConcurrency::new(driver.clone(), LaunchOptions::default());

        let custom = LaunchOptions {
            headless: false,
            args: vec!["--proxy-server=socks5://127.0.0.1:9050".into()],
            ..LaunchOptions::default()
        };
        let _worker = strategy.worker_instance(Some(custom.clone())).await.unwrap();
        let _default = strategy.worker_instance(None).await.unwrap();

        let launched = driver.launched_with();
        assert_eq!(launched, vec![custom, LaunchOptions::default()]);
    }

    #[tokio::test]
    async fn repair_relaunches_with_slot_options() {
        let driver = MockDriver::new();
        let strategy = BrowserConcurrency::new(driver.clone(), LaunchOptions::default());
        let custom = LaunchOptions {
            args: vec!["--lang=fr".into()],
            ..LaunchOptions::default()
        };
        let worker = strategy.worker_instance(Some(custom.clone())).await.unwrap();

        worker.repair().await.unwrap();

        let stats = driver.stats();
        assert_eq!(stats.launches, 2);
        assert_eq!(stats.browser_closes, 1);
        assert_eq!(driver.launched_with()[1], custom);

        let mut instance = worker.job_instance().await.unwrap();
        assert_eq!(instance.page().browser, 2);
        instance.close().await.unwrap();
    }

    #[tokio::test]
    async fn repair_after_close_launches_nothing() {
        let driver = MockDriver::new();
        let strategy = BrowserConcurrency::new(driver.clone(), LaunchOptions::default());
        let worker = strategy.worker_instance(None).await.unwrap();

        worker.close().await.unwrap();
        worker.repair().await.unwrap();

        let stats = driver.stats();
        assert_eq!(stats.launches, 1);
        assert_eq!(stats.browser_closes, 1);
        assert!(matches!(
            worker.job_instance().await.err(),
            Some(ClusterError::Closed)
        ));
    }

    #[tokio::test]
    async fn worker_launch_failure_propagates() {
        let driver = MockDriver::new();
        driver.fail_next_launches(1);
        let strategy = BrowserConcurrency::new(driver.clone(), LaunchOptions::default());
        assert!(strategy.worker_instance(None).await.is_err());
    }
}
