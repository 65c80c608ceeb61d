//! Lifecycle supervision
//!
//! Runs a set of [`MountTask`]s concurrently under one cancellation token.
//! The first task to return, successfully or not, decides the outcome of the
//! whole group: its result becomes the terminal result and every other task
//! is cancelled. Tasks then get a grace period to finish; whatever is still
//! running afterwards is aborted, abandoned without being awaited, and
//! reported as [`Error::ForcedClose`].

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use superservice_core::{Error, Result, ServiceState};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time tasks get to honour cancellation
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

type MountFn = Box<dyn FnOnce(CancellationToken, SocketAddr) -> BoxFuture<'static, Result<()>> + Send>;

/// A supervised unit of work.
///
/// Receives the shared cancellation token and the bound listener address.
/// Returning at all, even with `Ok`, stops the whole group.
pub struct MountTask {
    name: String,
    run: MountFn,
}

impl std::fmt::Debug for MountTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTask").field("name", &self.name).finish()
    }
}

impl MountTask {
    /// Create a task from an async function
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |token, addr| run(token, addr).boxed()),
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared view of a service's lifecycle state
#[derive(Debug, Clone)]
pub struct StateHandle {
    state: Arc<RwLock<ServiceState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(ServiceState::Idle)),
        }
    }
}

impl StateHandle {
    /// Current state
    pub fn get(&self) -> ServiceState {
        *self.state.read()
    }

    pub(crate) fn set(&self, next: ServiceState) {
        let mut state = self.state.write();
        debug!(from = %*state, to = %next, "Service state transition");
        *state = next;
    }
}

/// How a supervised group ended
#[derive(Debug)]
pub struct Supervision {
    /// Outcome of the first task to return, or [`Error::Cancelled`] when the
    /// parent token was cancelled first
    pub result: Result<()>,

    /// Name of the task whose outcome is `result`
    pub terminal_task: Option<String>,

    /// One [`Error::ForcedClose`] per task aborted after the grace period
    pub forced: Vec<Error>,
}

impl Supervision {
    /// The terminal result
    pub fn into_result(self) -> Result<()> {
        self.result
    }
}

/// Runs mount tasks with any-exit-stops-all semantics
#[derive(Debug)]
pub struct Supervisor {
    tasks: Vec<MountTask>,
    grace_period: Duration,
    parent: CancellationToken,
    state: StateHandle,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            parent: CancellationToken::new(),
            state: StateHandle::default(),
        }
    }

    /// Set the grace period
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Stop the group when `parent` is cancelled
    pub fn parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    /// Report lifecycle transitions through `state`
    pub fn state(mut self, state: StateHandle) -> Self {
        self.state = state;
        self
    }

    /// Append a task
    pub fn push(&mut self, task: MountTask) {
        self.tasks.push(task);
    }

    /// Append a task
    pub fn task(mut self, task: MountTask) -> Self {
        self.push(task);
        self
    }

    /// Launch every task, in order
    pub fn start(self, addr: SocketAddr) -> RunningGroup {
        let token = self.parent.child_token();
        let mut set = JoinSet::new();
        let mut names = HashMap::with_capacity(self.tasks.len());

        for task in self.tasks {
            debug!(task = %task.name, "Launching task");
            let handle = set.spawn((task.run)(token.clone(), addr));
            names.insert(handle.id(), task.name);
        }

        self.state.set(ServiceState::Running);

        RunningGroup {
            set,
            names,
            token,
            parent: self.parent,
            grace_period: self.grace_period,
            state: self.state,
        }
    }

    /// Launch every task and wait for the group to stop
    pub async fn run(self, addr: SocketAddr) -> Supervision {
        self.start(addr).wait().await
    }
}

/// A launched group of tasks
#[derive(Debug)]
pub struct RunningGroup {
    set: JoinSet<Result<()>>,
    names: HashMap<Id, String>,
    token: CancellationToken,
    parent: CancellationToken,
    grace_period: Duration,
    state: StateHandle,
}

impl RunningGroup {
    /// Token shared by every task in the group
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn task_name(&mut self, id: Id) -> String {
        self.names
            .remove(&id)
            .unwrap_or_else(|| format!("task-{id}"))
    }

    fn settle(&mut self, joined: std::result::Result<(Id, Result<()>), JoinError>) -> (String, Result<()>) {
        match joined {
            Ok((id, result)) => (self.task_name(id), result),
            Err(e) => {
                let name = self.task_name(e.id());
                let reason = if e.is_panic() { "panicked" } else { "was aborted" };
                (name.clone(), Err(Error::Runtime(format!("task {name} {reason}"))))
            }
        }
    }

    /// Wait for the first task to return, stop the rest, and report
    pub async fn wait(mut self) -> Supervision {
        let first = tokio::select! {
            biased;
            _ = self.parent.cancelled() => None,
            joined = self.set.join_next_with_id() => joined,
        };

        let (terminal_task, result) = match first {
            Some(joined) => {
                let (name, result) = self.settle(joined);
                match &result {
                    Ok(()) => info!(task = %name, "Task returned, stopping service"),
                    Err(e) => error!(task = %name, error = %e, "Task failed, stopping service"),
                }
                (Some(name), result)
            }
            None if self.parent.is_cancelled() => {
                info!("Shutdown requested, stopping service");
                (None, Err(Error::Cancelled))
            }
            None => (None, Ok(())),
        };

        self.state.set(ServiceState::Draining);
        self.token.cancel();

        let deadline = Instant::now() + self.grace_period;
        let mut forced = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.set.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    let (name, result) = self.settle(joined);
                    match result {
                        Ok(()) => debug!(task = %name, "Task stopped"),
                        Err(e) => debug!(task = %name, error = %e, "Task stopped with error"),
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    for task in self.names.drain().map(|(_, name)| name) {
                        warn!(task = %task, grace_period = ?self.grace_period, "Force close");
                        forced.push(Error::ForcedClose { task });
                    }
                    // a task that never yields cannot be aborted; abandon it
                    self.set.abort_all();
                    self.set.detach_all();
                    break;
                }
            }
        }

        self.state.set(ServiceState::Stopped);

        Supervision {
            result,
            terminal_task,
            forced,
        }
    }
}
