use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use corral_core::{BrowserDriver, ClusterError, LaunchOptions};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::binary::find_chrome_binary;

/// Flags applied to every launch, on top of [`LaunchOptions::args`].
const DEFAULT_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-popup-blocking",
    "--disable-translate",
    "--no-first-run",
];

/// [`BrowserDriver`] speaking the Chrome DevTools Protocol via
/// `chromiumoxide`.
///
/// Contexts are CDP browser contexts (incognito-like, no shared cookies or
/// storage); pages are tabs opened inside them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

/// A running Chromium process and the task polling its CDP connection.
pub struct ChromiumBrowser {
    browser: RwLock<Browser>,
    handler: JoinHandle<()>,
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

fn browser_error(context: &str, e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Browser(format!("{context}: {e}"))
}

fn resource_error(context: &str, e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Resource(format!("{context}: {e}"))
}

fn build_config(options: &LaunchOptions) -> Result<BrowserConfig, ClusterError> {
    let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

    if !options.headless {
        builder = builder.with_head();
    }

    if let Some(bin) = options.executable.clone().or_else(find_chrome_binary) {
        tracing::debug!(binary = %bin.display(), "Using Chrome binary");
        builder = builder.chrome_executable(bin);
    }
    if let Some(dir) = &options.user_data_dir {
        builder = builder.user_data_dir(dir);
    }
    if let Some((width, height)) = options.window_size {
        builder = builder.window_size(width, height);
    }

    builder
        .args(DEFAULT_ARGS.iter().copied())
        .args(options.args.iter().cloned())
        .build()
        .map_err(|e| ClusterError::Config(format!("Browser config error: {e}")))
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    type Browser = ChromiumBrowser;
    type Context = BrowserContextId;
    type Page = Page;

    async fn launch(&self, options: &LaunchOptions) -> Result<ChromiumBrowser, ClusterError> {
        let config = build_config(options)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| browser_error("Failed to launch browser", e))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(ChromiumBrowser {
            browser: RwLock::new(browser),
            handler,
        })
    }

    async fn close_browser(&self, browser: &ChromiumBrowser) -> Result<(), ClusterError> {
        let mut inner = browser.browser.write().await;
        let closed = inner.close().await;
        if let Err(e) = inner.wait().await {
            tracing::debug!(error = %e, "Browser process did not exit cleanly");
        }
        browser.handler.abort();
        closed
            .map(|_| ())
            .map_err(|e| browser_error("Failed to close browser", e))
    }

    async fn new_context(&self, browser: &ChromiumBrowser) -> Result<BrowserContextId, ClusterError> {
        let inner = browser.browser.read().await;
        let response = inner
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| resource_error("Failed to create browser context", e))?;
        Ok(response.result.browser_context_id)
    }

    async fn close_context(
        &self,
        browser: &ChromiumBrowser,
        context: &BrowserContextId,
    ) -> Result<(), ClusterError> {
        let inner = browser.browser.read().await;
        inner
            .execute(DisposeBrowserContextParams::new(context.clone()))
            .await
            .map(|_| ())
            .map_err(|e| resource_error("Failed to dispose browser context", e))
    }

    async fn new_page(
        &self,
        browser: &ChromiumBrowser,
        context: &BrowserContextId,
    ) -> Result<Page, ClusterError> {
        let mut params = CreateTargetParams::new("about:blank");
        params.browser_context_id = Some(context.clone());

        let inner = browser.browser.read().await;
        inner
            .new_page(params)
            .await
            .map_err(|e| resource_error("Failed to open page", e))
    }

    async fn close_page(&self, page: &Page) -> Result<(), ClusterError> {
        page.clone()
            .close()
            .await
            .map_err(|e| resource_error("Failed to close page", e))
    }
}
