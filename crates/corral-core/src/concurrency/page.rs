use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::concurrency::{
    BrowserDriver, LaunchOptions, ResourceAllocator, Resources, SingleBrowserImplementation,
};
use crate::error::ClusterError;

/// Allocator that opens every page in one lazily created context.
///
/// Cookies and storage are shared between all jobs of the cluster.
pub struct SharedContext<B: BrowserDriver> {
    context: Mutex<Option<Arc<B::Context>>>,
}

impl<B: BrowserDriver> Default for SharedContext<B> {
    fn default() -> Self {
        Self {
            context: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<B: BrowserDriver> ResourceAllocator<B> for SharedContext<B> {
    async fn create_resources(
        &self,
        driver: &B,
        browser: &B::Browser,
    ) -> Result<Resources<B>, ClusterError> {
        let context = {
            let mut cached = self.context.lock().await;
            match cached.as_ref() {
                Some(context) => Arc::clone(context),
                None => {
                    let context = Arc::new(driver.new_context(browser).await?);
                    *cached = Some(Arc::clone(&context));
                    context
                }
            }
        };
        let page = driver.new_page(browser, &context).await?;
        Ok(Resources {
            page,
            context: None,
        })
    }

    async fn free_resources(
        &self,
        driver: &B,
        _browser: &B::Browser,
        resources: Resources<B>,
    ) -> Result<(), ClusterError> {
        driver.close_page(&resources.page).await
    }

    async fn browser_relaunched(&self) {
        // The cached context died with the old browser.
        self.context.lock().await.take();
    }
}

/// Cheapest strategy: one shared browser and context, a fresh page per job.
pub type PageConcurrency<B> = SingleBrowserImplementation<B, SharedContext<B>>;

impl<B: BrowserDriver> SingleBrowserImplementation<B, SharedContext<B>> {
    /// Page-sharing strategy on top of `driver`.
    pub fn page(driver: B, options: LaunchOptions) -> Self {
        Self::new(driver, SharedContext::default(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyImplementation;
    use crate::testutil::MockDriver;

    #[tokio::test]
    async fn pages_share_one_context() {
        let driver = MockDriver::new();
        let strategy = PageConcurrency::page(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        let worker = strategy.worker_instance(None).await.unwrap();

        let mut first = worker.job_instance().await.unwrap();
        let mut second = worker.job_instance().await.unwrap();
        assert_eq!(first.page().context, second.page().context);
        assert_ne!(first.page().id, second.page().id);

        first.close().await.unwrap();
        second.close().await.unwrap();

        let stats = driver.stats();
        assert_eq!(stats.contexts_created, 1);
        assert_eq!(stats.pages_created, 2);
        assert_eq!(stats.pages_closed, 2);
        assert_eq!(stats.contexts_closed, 0);
    }

    #[tokio::test]
    async fn repair_drops_cached_context() {
        let driver = MockDriver::new();
        let strategy = PageConcurrency::page(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        let worker = strategy.worker_instance(None).await.unwrap();

        let mut before = worker.job_instance().await.unwrap();
        let old_context = before.page().context;
        before.close().await.unwrap();

        worker.repair().await.unwrap();

        let mut after = worker.job_instance().await.unwrap();
        assert_ne!(after.page().context, old_context);
        after.close().await.unwrap();
        assert_eq!(driver.stats().contexts_created, 2);
    }

    #[tokio::test]
    async fn release_failure_is_returned() {
        let driver = MockDriver::new();
        let strategy = PageConcurrency::page(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        let worker = strategy.worker_instance(None).await.unwrap();

        let mut instance = worker.job_instance().await.unwrap();
        driver.fail_next_page_closes(1);
        assert!(instance.close().await.is_err());
        assert_eq!(strategy.open_instances(), 0);
    }
}
