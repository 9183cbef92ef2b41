//! Worker pool internals.
//!
//! The coordinator in `pool` owns the slots; `spawn` starts thread or process
//! units for them; `worker_main` is the code that runs inside a unit.
//!
//! Architecture:
//! ```text
//! TaskDispatcher ──Command──► Coordinator ──WorkRequest──► worker unit
//!                                  ▲                           │
//!                                  └────────WorkerEvent────────┘
//! ```

mod ipc;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod thread;
mod worker_main;

pub(crate) use pool::{Command, Coordinator, PendingTask};
pub use pool::{PoolStats, SlotId};
pub use proc::SLOT_ENV;
pub use protocol::{SerializedError, WorkRequest, WorkResponse};
pub use signals::TerminationReason;
pub use worker_main::{ExecutionAdapter, run_worker_main};
