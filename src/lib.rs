//! taskpool - dispatch component method calls to a pool of isolated workers.
//!
//! Components are plain Rust types registered under stable string ids together with an
//! explicit method table. A [`TaskDispatcher`] owns a fixed number of worker slots,
//! each an OS thread or a child process with its own registry, and routes
//! `run_task::<Component, _>("method", args)` calls to free workers. Calls queue FIFO
//! while every worker is busy. A worker that dies is replaced and its in-flight task is
//! rejected.

pub mod context;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod registry;
pub mod strategy;
pub mod worker;

pub use dispatcher::{TaskDispatcher, TaskFuture};
pub use error::{DispatchError, Result};
pub use registry::{Component, ComponentRegistry};
pub use strategy::{
    ProcessEntry, RegistryFactory, SlotReuse, Strategy, TerminationPolicy, WorkerEntry,
};
pub use worker::{
    ExecutionAdapter, PoolStats, SerializedError, SlotId, TerminationReason, run_worker_main,
};
