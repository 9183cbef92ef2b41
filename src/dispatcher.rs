//! Public entry point: submit component method calls to the worker pool.
//!
//! # Example
//!
//! ```no_run
//! use taskpool::{Strategy, TaskDispatcher, demo};
//!
//! # async fn run() -> taskpool::Result<()> {
//! let dispatcher = TaskDispatcher::new(Strategy::threads(4, demo::registry), demo::registry());
//! dispatcher.start()?;
//!
//! let sum: i64 = dispatcher
//!     .run_task::<demo::Calc, _>("plus", (3, 4))?
//!     .decode()
//!     .await?;
//! assert_eq!(sum, 7);
//!
//! dispatcher.terminate();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, trace};

use crate::context::{self, ContextToken};
use crate::error::{DispatchError, Result};
use crate::registry::{ComponentRegistry, MethodFuture, encode_args, short_type_name};
use crate::strategy::Strategy;
use crate::worker::{Command, Coordinator, PendingTask, PoolStats, SerializedError};

/// Handle to a worker pool. Cheap to clone; all clones drive the same pool.
///
/// The pool shuts down once [`terminate`](Self::terminate) is called or the last
/// handle is dropped.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    strategy: Strategy,
    /// Used on the calling side to map types to ids.
    registry: ComponentRegistry,
    commands: OnceLock<mpsc::UnboundedSender<Command>>,
    started: AtomicBool,
    terminated: AtomicBool,
}

impl TaskDispatcher {
    pub fn new(strategy: Strategy, registry: ComponentRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy,
                registry,
                commands: OnceLock::new(),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.inner.strategy
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.inner.registry
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Spawn `max_threads` workers and start the coordinator on the current tokio
    /// runtime.
    ///
    /// Returns before the workers are ready; tasks submitted meanwhile are buffered.
    /// Can only be called once.
    pub fn start(&self) -> Result<()> {
        let strategy = &self.inner.strategy;
        strategy.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        if self.is_terminated() {
            return Err(DispatchError::Terminated);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut coordinator = Coordinator::new(strategy.clone(), events_tx);
        if let Err(e) = coordinator.fill() {
            coordinator.abort();
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(
            workers = strategy.max_threads,
            mode = coordinator.mode(),
            "Task dispatcher started"
        );
        runtime.spawn(coordinator.run(commands_rx, events_rx));
        let _ = self.inner.commands.set(commands_tx);
        Ok(())
    }

    /// Run `method_name` on the component registered for `C`.
    ///
    /// `args` is encoded as a positional list: pass a tuple for several arguments and
    /// `()` for none. A bare sequence is spread into separate arguments, so a method
    /// taking one `Vec` must be called with `(vec,)`. The call is checked and queued
    /// synchronously; the returned future settles with the method's result.
    ///
    /// Called from inside a worker, the method runs in place on that worker instead of
    /// going back through the pool.
    pub fn run_task<C: 'static, A: Serialize>(
        &self,
        method_name: &str,
        args: A,
    ) -> Result<TaskFuture> {
        let component_id = self
            .inner
            .registry
            .id_of::<C>()
            .ok_or_else(|| DispatchError::NotAComponent(short_type_name::<C>()))?
            .to_string();
        self.submit(component_id, method_name, encode_args(args)?)
    }

    /// Like [`run_task`](Self::run_task), addressing the component by id.
    pub fn run_task_by_id<A: Serialize>(
        &self,
        component_id: &str,
        method_name: &str,
        args: A,
    ) -> Result<TaskFuture> {
        if !self.inner.registry.contains(component_id) {
            return Err(DispatchError::NotAComponent(component_id.to_string()));
        }
        self.submit(component_id.to_string(), method_name, encode_args(args)?)
    }

    fn submit(
        &self,
        component_id: String,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<TaskFuture> {
        if let Some(local) = context::worker_registry() {
            trace!(
                component = %component_id,
                method = method_name,
                "Inside a worker, running in place"
            );
            return Ok(TaskFuture::local(local.invoke(&component_id, method_name, args)));
        }

        let commands = self
            .inner
            .commands
            .get()
            .ok_or(DispatchError::NotStarted)?;
        if self.is_terminated() {
            return Err(DispatchError::Terminated);
        }

        let (reply, receiver) = oneshot::channel();
        let task = PendingTask {
            component_id,
            method_name: method_name.to_string(),
            args,
            reply,
            context: ContextToken::capture(),
        };
        commands
            .send(Command::Run(task))
            .map_err(|_| DispatchError::Terminated)?;
        Ok(TaskFuture::remote(receiver))
    }

    /// Current pool statistics.
    pub async fn stats(&self) -> Result<PoolStats> {
        let commands = self
            .inner
            .commands
            .get()
            .ok_or(DispatchError::NotStarted)?;
        let (reply, receiver) = oneshot::channel();
        commands
            .send(Command::Stats(reply))
            .map_err(|_| DispatchError::Terminated)?;
        receiver.await.map_err(|_| DispatchError::Terminated)
    }

    /// Stop the pool. Never fails and may be called any number of times.
    ///
    /// Workers are asked to exit; unsettled tasks are handled according to the
    /// strategy's termination policy. New calls are refused from here on.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(commands) = self.inner.commands.get() {
            info!("Terminating task dispatcher");
            let _ = commands.send(Command::Terminate);
        }
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("strategy", &self.inner.strategy)
            .field("registry", &self.inner.registry)
            .field("started", &self.is_started())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Settles with the result of a submitted task.
pub struct TaskFuture {
    inner: TaskFutureInner,
}

enum TaskFutureInner {
    /// Running on a pool worker.
    Remote(oneshot::Receiver<Result<Value>>),
    /// Running in place on the current worker.
    Local(Pin<Box<dyn Future<Output = Result<Value>> + Send>>),
}

impl TaskFuture {
    fn remote(receiver: oneshot::Receiver<Result<Value>>) -> Self {
        Self {
            inner: TaskFutureInner::Remote(receiver),
        }
    }

    fn local(pending: std::result::Result<MethodFuture, SerializedError>) -> Self {
        let future = async move {
            match pending {
                Ok(future) => future.await.map_err(DispatchError::Task),
                Err(e) => Err(DispatchError::Task(e)),
            }
        };
        Self {
            inner: TaskFutureInner::Local(Box::pin(future)),
        }
    }

    /// Await the result and deserialize it as `R`.
    pub async fn decode<R: DeserializeOwned>(self) -> Result<R> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for TaskFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            TaskFutureInner::Remote(receiver) => Pin::new(receiver)
                .poll(cx)
                // The coordinator dropped the task without settling it
                .map(|received| received.unwrap_or_else(|_| Err(DispatchError::Terminated))),
            TaskFutureInner::Local(future) => future.as_mut().poll(cx),
        }
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            TaskFutureInner::Remote(_) => "remote",
            TaskFutureInner::Local(_) => "local",
        };
        f.debug_struct("TaskFuture").field("kind", &kind).finish()
    }
}
