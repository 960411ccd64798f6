use async_trait::async_trait;

use crate::concurrency::LaunchOptions;
use crate::error::ClusterError;

/// Narrow interface to a browser-automation engine.
///
/// The built-in strategies only ever talk to the browser through this
/// trait, so any engine (CDP, WebDriver, a test double) can back them.
#[async_trait]
pub trait BrowserDriver: Send + Sync + 'static {
    type Browser: Send + Sync + 'static;
    type Context: Send + Sync + 'static;
    /// Page handle passed to task functions. Cloning must be cheap and
    /// refer to the same page.
    type Page: Clone + Send + Sync + 'static;

    async fn launch(&self, options: &LaunchOptions) -> Result<Self::Browser, ClusterError>;

    async fn close_browser(&self, browser: &Self::Browser) -> Result<(), ClusterError>;

    /// Create an isolated browsing context (no shared cookies or storage).
    async fn new_context(&self, browser: &Self::Browser) -> Result<Self::Context, ClusterError>;

    async fn close_context(
        &self,
        browser: &Self::Browser,
        context: &Self::Context,
    ) -> Result<(), ClusterError>;

    async fn new_page(
        &self,
        browser: &Self::Browser,
        context: &Self::Context,
    ) -> Result<Self::Page, ClusterError>;

    async fn close_page(&self, page: &Self::Page) -> Result<(), ClusterError>;
}
