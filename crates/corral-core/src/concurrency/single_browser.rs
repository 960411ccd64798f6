//! Shared base for strategies that run every worker on one browser.
//!
//! Repair protocol: a repair is requested when acquiring or releasing a job
//! instance fails. It only runs once no job instance is checked out and no
//! other repair is in flight; until then callers park on a waiter list that
//! is released in one go when the relaunch finishes.
//!
//! ```text
//!          request repair
//! IDLE ──────────────────────> REQUESTED ──(open_instances == 0)──> REPAIRING
//!   ^                                                                  |
//!   └──────────────── relaunch done, wake all waiters ─────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::concurrency::{
    BrowserDriver, ConcurrencyImplementation, JobInstance, LaunchOptions, WorkerInstance,
    with_resource_timeout,
};
use crate::error::ClusterError;

/// Resources minted for one job.
pub struct Resources<B: BrowserDriver> {
    pub page: B::Page,
    /// Context owned by this job alone, closed together with it.
    pub context: Option<B::Context>,
}

/// Decides which resources a job gets on the shared browser.
#[async_trait]
pub trait ResourceAllocator<B: BrowserDriver>: Send + Sync + 'static {
    async fn create_resources(
        &self,
        driver: &B,
        browser: &B::Browser,
    ) -> Result<Resources<B>, ClusterError>;

    async fn free_resources(
        &self,
        driver: &B,
        browser: &B::Browser,
        resources: Resources<B>,
    ) -> Result<(), ClusterError>;

    /// Called during repair, before the replacement browser is launched.
    async fn browser_relaunched(&self) {}
}

#[derive(Default)]
struct RepairState {
    repairing: bool,
    repair_requested: bool,
    open_instances: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

enum RepairTurn {
    Run,
    Wait(oneshot::Receiver<()>),
    Skip,
}

struct Shared<B: BrowserDriver, A> {
    driver: B,
    allocator: A,
    options: LaunchOptions,
    browser: Mutex<Option<Arc<B::Browser>>>,
    repair: Mutex<RepairState>,
    /// Set by `close()`; no browser is launched afterwards.
    closed: AtomicBool,
}

impl<B: BrowserDriver, A: ResourceAllocator<B>> Shared<B, A> {
    fn lock_repair(&self) -> MutexGuard<'_, RepairState> {
        self.repair.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned repair mutex");
            poisoned.into_inner()
        })
    }

    fn lock_browser(&self) -> MutexGuard<'_, Option<Arc<B::Browser>>> {
        self.browser.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_browser(&self) -> Result<Arc<B::Browser>, ClusterError> {
        self.lock_browser()
            .clone()
            .ok_or_else(|| ClusterError::Browser("browser is not running".into()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn release_waiters(&self) {
        let waiters = {
            let mut state = self.lock_repair();
            state.repair_requested = false;
            state.repairing = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        let turn = {
            let mut state = self.lock_repair();
            if state.repairing || (state.open_instances != 0 && !self.is_closed()) {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                RepairTurn::Wait(rx)
            } else if self.is_closed() {
                RepairTurn::Skip
            } else {
                state.repairing = true;
                RepairTurn::Run
            }
        };

        match turn {
            RepairTurn::Run => {}
            RepairTurn::Wait(rx) => {
                // Already repairing, or pages are still open: wait for that repair.
                let _ = rx.await;
                return Ok(());
            }
            RepairTurn::Skip => {
                tracing::debug!("Skipping repair, browser is closed");
                self.release_waiters();
                return Ok(());
            }
        }

        tracing::debug!("Starting repair");

        let old = self.lock_browser().take();
        if let Some(old) = old {
            // Will probably fail, the browser is likely broken already.
            if let Err(e) = self.driver.close_browser(&old).await {
                tracing::debug!(error = %e, "Unable to close browser");
            }
        }
        self.allocator.browser_relaunched().await;

        let result = match self.driver.launch(&self.options).await {
            Ok(browser) if self.is_closed() => {
                // Closed while relaunching.
                if let Err(e) = self.driver.close_browser(&browser).await {
                    tracing::debug!(error = %e, "Unable to close browser");
                }
                Ok(())
            }
            Ok(browser) => {
                *self.lock_browser() = Some(Arc::new(browser));
                Ok(())
            }
            Err(e) => Err(ClusterError::Launch(format!("Unable to restart browser: {e}"))),
        };

        self.release_waiters();

        match &result {
            Ok(()) => tracing::debug!("Repair finished"),
            Err(e) => tracing::warn!(error = %e, "Repair failed"),
        }
        result
    }

    async fn job_instance(
        self: &Arc<Self>,
    ) -> Result<Box<dyn JobInstance<B::Page>>, ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::Closed);
        }
        let requested = self.lock_repair().repair_requested;
        if requested {
            self.repair().await?;
        }

        let browser = self.current_browser()?;
        let resources =
            with_resource_timeout(self.allocator.create_resources(&self.driver, &browser)).await?;
        self.lock_repair().open_instances += 1;

        Ok(Box::new(SharedJobInstance {
            shared: Arc::clone(self),
            browser,
            page: resources.page.clone(),
            resources: Some(resources),
        }))
    }
}

/// Base for [`crate::concurrency::PageConcurrency`] and
/// [`crate::concurrency::ContextConcurrency`]: one browser shared by all
/// workers, relaunched through the repair protocol.
pub struct SingleBrowserImplementation<B: BrowserDriver, A> {
    shared: Arc<Shared<B, A>>,
}

impl<B: BrowserDriver, A: ResourceAllocator<B>> SingleBrowserImplementation<B, A> {
    pub fn new(driver: B, allocator: A, options: LaunchOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                allocator,
                options,
                browser: Mutex::new(None),
                repair: Mutex::new(RepairState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of job instances currently checked out.
    pub fn open_instances(&self) -> usize {
        self.shared.lock_repair().open_instances
    }
}

#[async_trait]
impl<B, A> ConcurrencyImplementation<B::Page> for SingleBrowserImplementation<B, A>
where
    B: BrowserDriver,
    A: ResourceAllocator<B>,
{
    async fn init(&self) -> Result<(), ClusterError> {
        let browser = self.shared.driver.launch(&self.shared.options).await?;
        *self.shared.lock_browser() = Some(Arc::new(browser));
        Ok(())
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Repairs parked behind open instances would never run now.
        let repairing = self.shared.lock_repair().repairing;
        if !repairing {
            self.shared.release_waiters();
        }
        let browser = self.shared.lock_browser().take();
        match browser {
            Some(browser) => self.shared.driver.close_browser(&browser).await,
            None => Ok(()),
        }
    }

    async fn worker_instance(
        &self,
        _options: Option<LaunchOptions>,
    ) -> Result<Box<dyn WorkerInstance<B::Page>>, ClusterError> {
        Ok(Box::new(SharedWorkerInstance {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SharedWorkerInstance<B: BrowserDriver, A> {
    shared: Arc<Shared<B, A>>,
}

#[async_trait]
impl<B, A> WorkerInstance<B::Page> for SharedWorkerInstance<B, A>
where
    B: BrowserDriver,
    A: ResourceAllocator<B>,
{
    async fn job_instance(&self) -> Result<Box<dyn JobInstance<B::Page>>, ClusterError> {
        self.shared.job_instance().await
    }

    async fn close(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        tracing::debug!("Repair requested");
        self.shared.lock_repair().repair_requested = true;
        self.shared.repair().await
    }
}

struct SharedJobInstance<B: BrowserDriver, A> {
    shared: Arc<Shared<B, A>>,
    browser: Arc<B::Browser>,
    page: B::Page,
    resources: Option<Resources<B>>,
}

#[async_trait]
impl<B, A> JobInstance<B::Page> for SharedJobInstance<B, A>
where
    B: BrowserDriver,
    A: ResourceAllocator<B>,
{
    fn page(&self) -> &B::Page {
        &self.page
    }

    async fn close(&mut self) -> Result<(), ClusterError> {
        let Some(resources) = self.resources.take() else {
            return Ok(());
        };

        // Decrement first so a failing release cannot block repairs forever.
        let requested = {
            let mut state = self.shared.lock_repair();
            state.open_instances = state.open_instances.saturating_sub(1);
            state.repair_requested
        };

        let result = with_resource_timeout(self.shared.allocator.free_resources(
            &self.shared.driver,
            &self.browser,
            resources,
        ))
        .await;

        let requested = requested || self.shared.lock_repair().repair_requested;
        if requested {
            self.shared.repair().await?;
        }
        result
    }
}
