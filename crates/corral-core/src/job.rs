use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;
use url::Url;

use crate::error::ClusterError;

/// Identity of the worker running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRef {
    pub id: usize,
}

/// Arguments handed to a task function.
pub struct TaskArgs<D, P> {
    /// Page handle owned by the worker for the duration of the job.
    pub page: P,
    /// Job payload; `None` when the job was queued with only a task function.
    pub data: Option<D>,
    pub worker: WorkerRef,
}

/// A boxed task function, shared between the cluster and its jobs.
pub type TaskFn<D, R, P> =
    Arc<dyn Fn(TaskArgs<D, P>) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Box an async closure into a [`TaskFn`].
///
/// ```rust,ignore
/// let visit = corral_core::task(|args: TaskArgs<String, Page>| async move {
///     args.page.goto(args.data.unwrap_or_default()).await?;
///     Ok(())
/// });
/// ```
pub fn task<D, R, P, F, Fut>(f: F) -> TaskFn<D, R, P>
where
    F: Fn(TaskArgs<D, P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Completion channel of an `execute`-style submission.
pub(crate) type ExecuteCallback<R> = oneshot::Sender<Result<R, ClusterError>>;

/// One unit of submitted work.
pub struct Job<D, R, P> {
    pub(crate) data: Option<D>,
    pub(crate) task: Option<TaskFn<D, R, P>>,
    pub(crate) callback: Option<ExecuteCallback<R>>,
    tries: u32,
    last_error: Option<ClusterError>,
    url: Option<String>,
    domain: Option<String>,
}

impl<D: Serialize, R, P> Job<D, R, P> {
    pub(crate) fn new(
        data: Option<D>,
        task: Option<TaskFn<D, R, P>>,
        callback: Option<ExecuteCallback<R>>,
    ) -> Self {
        let url = data.as_ref().and_then(extract_url);
        let domain = url.as_deref().and_then(extract_domain);
        Self {
            data,
            task,
            callback,
            tries: 0,
            last_error: None,
            url,
            domain,
        }
    }
}

impl<D, R, P> Job<D, R, P> {
    pub fn data(&self) -> Option<&D> {
        self.data.as_ref()
    }

    /// URL of the payload: the payload itself when it is a string, or its
    /// `url` field when it is an object.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Host name of [`Job::url`], if it parses and has one.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Number of failed attempts so far.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn last_error(&self) -> Option<&ClusterError> {
        self.last_error.as_ref()
    }

    pub(crate) fn add_error(&mut self, error: ClusterError) {
        self.tries += 1;
        self.last_error = Some(error);
    }

    pub(crate) fn is_execute(&self) -> bool {
        self.callback.is_some()
    }
}

impl<D: fmt::Debug, R, P> fmt::Debug for Job<D, R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("data", &self.data)
            .field("url", &self.url)
            .field("tries", &self.tries)
            .field("has_task", &self.task.is_some())
            .field("is_execute", &self.callback.is_some())
            .finish()
    }
}

fn extract_url<D: Serialize>(data: &D) -> Option<String> {
    match serde_json::to_value(data).ok()? {
        serde_json::Value::String(url) => Some(url),
        serde_json::Value::Object(mut map) => match map.remove("url") {
            Some(serde_json::Value::String(url)) => Some(url),
            _ => None,
        },
        _ => None,
    }
}

fn extract_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}
