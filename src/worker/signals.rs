//! Why a worker went away.
//!
//! Exit statuses and panic payloads are turned into a [`TerminationReason`] so crash
//! errors say more than "worker died".

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Exit code of a Rust process that died from an unhandled panic.
const PANIC_EXIT_CODE: i32 = 101;

/// Reason why a worker terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Process exited with status code.
    Exited(i32),
    /// SIGKILL, from the OOM killer or an operator.
    Killed,
    /// SIGSEGV or SIGBUS; usually a stack overflow.
    Faulted(Signal),
    /// Process killed by any other signal.
    Signaled(Signal),
    /// Worker thread panicked.
    Panicked(String),
    /// The channel to the worker closed while it still had work.
    Disconnected,
    Unknown,
}

impl TerminationReason {
    /// Whether the worker ended on its own with status 0.
    pub fn is_success(&self) -> bool {
        *self == Self::Exited(0)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(PANIC_EXIT_CODE) => write!(f, "exited with code {PANIC_EXIT_CODE} (panic)"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Killed => f.write_str("killed by SIGKILL (out of memory?)"),
            Self::Faulted(sig) => write!(f, "crashed with {sig:?} (stack overflow?)"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::Disconnected => f.write_str("stopped accepting requests"),
            Self::Unknown => f.write_str("terminated for an unknown reason"),
        }
    }
}

/// Classify the status reported by `waitpid`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, sig @ (Signal::SIGSEGV | Signal::SIGBUS), _) => {
            TerminationReason::Faulted(sig)
        }
        WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
        _ => TerminationReason::Unknown,
    }
}

/// Extract the message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Information about a worker failure, for logging.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Why the worker terminated.
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
        }
    }

    /// Add context about what the worker was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}
