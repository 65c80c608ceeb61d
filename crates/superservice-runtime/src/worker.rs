//! Background workers
//!
//! A worker runs for the lifetime of the service. Its return, with or
//! without an error, ends the whole service.

use crate::supervisor::MountTask;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use superservice_core::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

type WorkerFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A named background task
pub struct Worker {
    name: String,
    full_name: String,
    run: WorkerFn,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("full_name", &self.full_name)
            .finish()
    }
}

impl Worker {
    /// Worker named after the function's type
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let full_name = std::any::type_name::<F>().to_string();
        let name = display_name(&full_name);
        Self::build(name, full_name, run)
    }

    /// Worker with an explicit display name
    pub fn named<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::build(name.into(), std::any::type_name::<F>().to_string(), run)
    }

    fn build<F, Fut>(name: String, full_name: String, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            full_name,
            run: Box::new(move |token| run(token).boxed()),
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified type name of the worker function
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub(crate) fn into_task(self) -> MountTask {
        let Worker { name, full_name, run } = self;
        MountTask::new(format!("worker:{name}"), move |token: CancellationToken, _| async move {
            info!(worker = %name, function = %full_name, "Starting worker");
            match run(token).await {
                Ok(()) => Err(Error::WorkerTerminated(name)),
                Err(e) => Err(Error::worker(name, e)),
            }
        })
    }
}

/// Last path segment of a type name; closures keep their enclosing function
fn display_name(full_name: &str) -> String {
    let segments: Vec<&str> = full_name.split("::").collect();
    let mut name = segments.last().copied().unwrap_or(full_name);

    if name.starts_with("{{closure}}") && segments.len() > 1 {
        name = segments[segments.len() - 2];
    }

    name.to_string()
}
