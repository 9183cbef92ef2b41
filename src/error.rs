//! Error types for taskpool.

use std::time::Duration;

use thiserror::Error;

use crate::worker::{SerializedError, SlotId, TerminationReason};

/// Main error type for dispatching tasks.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The requested type has no stable id in the component registry.
    #[error("{0} is not a registered component")]
    NotAComponent(String),

    /// The invoked method failed inside a worker.
    ///
    /// The original error type does not survive the boundary; only its message and
    /// serialized properties do.
    #[error("{}", .0.message)]
    Task(SerializedError),

    #[error("Worker {slot} crashed: {reason}")]
    WorkerCrashed {
        slot: SlotId,
        reason: TerminationReason,
    },

    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Dispatcher is not started. Call start() first.")]
    NotStarted,

    #[error("Dispatcher is already started")]
    AlreadyStarted,

    #[error("Dispatcher has been terminated")]
    Terminated,

    #[error("No tokio runtime available to run the pool coordinator")]
    NoRuntime,

    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// The serialized error when the failure came from the invoked method.
    pub fn task_error(&self) -> Option<&SerializedError> {
        match self {
            Self::Task(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the worker itself died while running the task.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::WorkerCrashed { .. })
    }
}

/// Result type alias for taskpool operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
