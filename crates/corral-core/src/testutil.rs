//! Test utilities: mock browser driver, worker instances and reporter.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::concurrency::{BrowserDriver, JobInstance, LaunchOptions, WorkerInstance};
use crate::error::ClusterError;
use crate::events::{ClusterEvent, ClusterReporter};

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockBrowser {
    pub id: u64,
}

#[derive(Debug)]
pub struct MockContext {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPage {
    pub id: u64,
    pub context: u64,
    pub browser: u64,
}

/// Counters of every call the driver received.
#[derive(Debug, Clone, Default)]
pub struct MockDriverStats {
    pub launches: usize,
    pub browser_closes: usize,
    pub contexts_created: usize,
    pub contexts_closed: usize,
    pub pages_created: usize,
    pub pages_closed: usize,
}

#[derive(Default)]
struct MockDriverState {
    stats: MockDriverStats,
    launched_with: Vec<LaunchOptions>,
    next_id: u64,
    fail_launches: usize,
    fail_pages: usize,
    fail_page_closes: usize,
    launch_delay: Option<Duration>,
    page_delay: Option<Duration>,
}

/// In-memory browser driver with injectable failures and delays.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockDriverState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MockDriverStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Options of every successful or failed launch, in order.
    pub fn launched_with(&self) -> Vec<LaunchOptions> {
        self.state.lock().unwrap().launched_with.clone()
    }

    pub fn fail_next_launches(&self, n: usize) {
        self.state.lock().unwrap().fail_launches = n;
    }

    pub fn fail_next_pages(&self, n: usize) {
        self.state.lock().unwrap().fail_pages = n;
    }

    pub fn fail_next_page_closes(&self, n: usize) {
        self.state.lock().unwrap().fail_page_closes = n;
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().launch_delay = Some(delay);
    }

    pub fn set_page_delay(&self, delay: Duration) {
        self.state.lock().unwrap().page_delay = Some(delay);
    }

    fn next_id(state: &mut MockDriverState) -> u64 {
        state.next_id += 1;
        state.next_id
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    type Browser = MockBrowser;
    type Context = MockContext;
    type Page = MockPage;

    async fn launch(&self, options: &LaunchOptions) -> Result<MockBrowser, ClusterError> {
        let delay = self.state.lock().unwrap().launch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.launched_with.push(options.clone());
        if state.fail_launches > 0 {
            state.fail_launches -= 1;
            return Err(ClusterError::Browser("launch failed".into()));
        }
        state.stats.launches += 1;
        Ok(MockBrowser {
            id: state.stats.launches as u64,
        })
    }

    async fn close_browser(&self, _browser: &MockBrowser) -> Result<(), ClusterError> {
        self.state.lock().unwrap().stats.browser_closes += 1;
        Ok(())
    }

    async fn new_context(&self, _browser: &MockBrowser) -> Result<MockContext, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.stats.contexts_created += 1;
        Ok(MockContext {
            id: Self::next_id(&mut state),
        })
    }

    async fn close_context(
        &self,
        _browser: &MockBrowser,
        _context: &MockContext,
    ) -> Result<(), ClusterError> {
        self.state.lock().unwrap().stats.contexts_closed += 1;
        Ok(())
    }

    async fn new_page(
        &self,
        browser: &MockBrowser,
        context: &MockContext,
    ) -> Result<MockPage, ClusterError> {
        let delay = self.state.lock().unwrap().page_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_pages > 0 {
            state.fail_pages -= 1;
            return Err(ClusterError::Browser("page creation failed".into()));
        }
        state.stats.pages_created += 1;
        Ok(MockPage {
            id: Self::next_id(&mut state),
            context: context.id,
            browser: browser.id,
        })
    }

    async fn close_page(&self, _page: &MockPage) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_page_closes > 0 {
            state.fail_page_closes -= 1;
            return Err(ClusterError::Browser("page close failed".into()));
        }
        state.stats.pages_closed += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlakyWorkerInstance
// ---------------------------------------------------------------------------

/// Worker instance whose acquire/release calls fail a configurable number
/// of times, counting repairs.
#[derive(Clone, Default)]
pub struct FlakyWorkerInstance {
    acquire_failures: Arc<AtomicU32>,
    release_failures: Arc<AtomicU32>,
    /// Fail with [`ClusterError::Closed`], which does not call for a repair.
    closed_failures: Arc<AtomicBool>,
    pub acquisitions: Arc<AtomicU32>,
    pub releases: Arc<AtomicU32>,
    pub repairs: Arc<AtomicU32>,
    pub closes: Arc<AtomicU32>,
}

impl FlakyWorkerInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_acquire(n: u32) -> Self {
        let instance = Self::default();
        instance.acquire_failures.store(n, Ordering::SeqCst);
        instance
    }

    pub fn failing_release(n: u32) -> Self {
        let instance = Self::default();
        instance.release_failures.store(n, Ordering::SeqCst);
        instance
    }

    /// Like [`FlakyWorkerInstance::failing_acquire`], but the failures come
    /// from a closed strategy rather than a broken browser.
    pub fn failing_acquire_closed(n: u32) -> Self {
        let instance = Self::failing_acquire(n);
        instance.closed_failures.store(true, Ordering::SeqCst);
        instance
    }

    fn failure(&self, message: &str) -> ClusterError {
        if self.closed_failures.load(Ordering::SeqCst) {
            ClusterError::Closed
        } else {
            ClusterError::Resource(message.into())
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkerInstance<MockPage> for FlakyWorkerInstance {
    async fn job_instance(&self) -> Result<Box<dyn JobInstance<MockPage>>, ClusterError> {
        if Self::take_failure(&self.acquire_failures) {
            return Err(self.failure("no page available"));
        }
        let id = self.acquisitions.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok(Box::new(FlakyJob {
            page: MockPage {
                id,
                context: 0,
                browser: 0,
            },
            owner: self.clone(),
        }))
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        self.repairs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlakyJob {
    page: MockPage,
    owner: FlakyWorkerInstance,
}

#[async_trait]
impl JobInstance<MockPage> for FlakyJob {
    fn page(&self) -> &MockPage {
        &self.page
    }

    async fn close(&mut self) -> Result<(), ClusterError> {
        if FlakyWorkerInstance::take_failure(&self.owner.release_failures) {
            return Err(self.owner.failure("page close failed"));
        }
        self.owner.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Cluster reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == label).count()
    }
}

impl<D> ClusterReporter<D> for MockReporter {
    fn report(&self, event: ClusterEvent<'_, D>) {
        let label = match &event {
            ClusterEvent::Queued { .. } => "Queued".to_string(),
            ClusterEvent::TaskError { will_retry, .. } => format!("TaskError(retry={will_retry})"),
            ClusterEvent::Idle => "Idle".to_string(),
            ClusterEvent::WorkerLaunched { .. } => "WorkerLaunched".to_string(),
            ClusterEvent::WorkerLaunchFailed { .. } => "WorkerLaunchFailed".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}
