use async_trait::async_trait;

use crate::concurrency::{
    BrowserDriver, LaunchOptions, ResourceAllocator, Resources, SingleBrowserImplementation,
};
use crate::error::ClusterError;

/// Allocator that gives every job its own context on the shared browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct IsolatedContext;

#[async_trait]
impl<B: BrowserDriver> ResourceAllocator<B> for IsolatedContext {
    async fn create_resources(
        &self,
        driver: &B,
        browser: &B::Browser,
    ) -> Result<Resources<B>, ClusterError> {
        let context = driver.new_context(browser).await?;
        match driver.new_page(browser, &context).await {
            Ok(page) => Ok(Resources {
                page,
                context: Some(context),
            }),
            Err(e) => {
                let _ = driver.close_context(browser, &context).await;
                Err(e)
            }
        }
    }

    async fn free_resources(
        &self,
        driver: &B,
        browser: &B::Browser,
        resources: Resources<B>,
    ) -> Result<(), ClusterError> {
        match resources.context {
            Some(context) => driver.close_context(browser, &context).await,
            None => driver.close_page(&resources.page).await,
        }
    }
}

/// One shared browser, a fresh isolated context per job.
pub type ContextConcurrency<B> = SingleBrowserImplementation<B, IsolatedContext>;

impl<B: BrowserDriver> SingleBrowserImplementation<B, IsolatedContext> {
    /// Context-isolated strategy on top of `driver`.
    pub fn context(driver: B, options: LaunchOptions) -> Self {
        Self::new(driver, IsolatedContext, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyImplementation;
    use crate::testutil::MockDriver;

    #[tokio::test]
    async fn every_job_gets_its_own_context() {
        let driver = MockDriver::new();
        let strategy = ContextConcurrency::context(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        let worker = strategy.worker_instance(None).await.unwrap();

        let mut first = worker.job_instance().await.unwrap();
        let mut second = worker.job_instance().await.unwrap();
        assert_ne!(first.page().context, second.page().context);
        assert_eq!(first.page().browser, second.page().browser);

        first.close().await.unwrap();
        second.close().await.unwrap();

        let stats = driver.stats();
        assert_eq!(stats.contexts_created, 2);
        assert_eq!(stats.contexts_closed, 2);
    }

    #[tokio::test]
    async fn context_is_closed_when_page_creation_fails() {
        let driver = MockDriver::new();
        let strategy = ContextConcurrency::context(driver.clone(), LaunchOptions::default());
        strategy.init().await.unwrap();
        let worker = strategy.worker_instance(None).await.unwrap();

        driver.fail_next_pages(1);
        assert!(worker.job_instance().await.is_err());

        let stats = driver.stats();
        assert_eq!(stats.contexts_created, 1);
        assert_eq!(stats.contexts_closed, 1);
        assert_eq!(strategy.open_instances(), 0);
    }
}
