//! Worker spawning.
//!
//! Turns a [`WorkerEntry`] into a running execution unit and hides the difference
//! between threads and processes behind [`WorkerHandle`]. Both kinds report back
//! through the same event channel.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::pool::{SlotId, WorkerEvent};
use super::proc::Proc;
use super::protocol::WorkRequest;
use super::thread::spawn_thread;
use crate::error::Result;
use crate::strategy::WorkerEntry;

#[derive(Debug)]
enum WorkerUnit {
    /// Threads cannot be interrupted; a killed thread is detached.
    Thread { name: String },
    Process(Proc),
}

/// Coordinator-side handle to one worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    slot: SlotId,
    requests: Option<mpsc::UnboundedSender<WorkRequest>>,
    unit: WorkerUnit,
}

/// Spawn a worker for `slot`. It sends a `ready` message once it accepts work.
pub(crate) fn spawn_worker(
    entry: &WorkerEntry,
    slot: SlotId,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let (unit, requests) = match entry {
        WorkerEntry::Thread(factory) => {
            let (name, requests) = spawn_thread(factory, slot, events)?;
            (WorkerUnit::Thread { name }, requests)
        }
        WorkerEntry::Process(process) => {
            let (proc, requests) = Proc::spawn(process, slot, events)?;
            (WorkerUnit::Process(proc), requests)
        }
    };
    Ok(WorkerHandle {
        slot,
        requests: Some(requests),
        unit,
    })
}

impl WorkerHandle {
    /// Queue a request for the worker.
    ///
    /// Hands the request back if the worker no longer accepts requests.
    pub(crate) fn send(&self, request: WorkRequest) -> std::result::Result<(), WorkRequest> {
        match &self.requests {
            Some(requests) => requests.send(request).map_err(|e| e.0),
            None => Err(request),
        }
    }

    /// Ask the worker to exit once its current call finishes.
    pub(crate) fn stop(&mut self) {
        if let Some(requests) = self.requests.take() {
            let _ = requests.send(WorkRequest::Exit);
        }
    }

    /// Stop the worker without waiting for its current call.
    pub(crate) fn kill(&mut self) {
        self.stop();
        match &self.unit {
            WorkerUnit::Thread { name } => {
                debug!(slot = %self.slot, thread = %name, "Detaching worker thread");
            }
            WorkerUnit::Process(proc) => {
                if let Err(e) = proc.kill() {
                    warn!(slot = %self.slot, error = %e, "Failed to kill worker process");
                }
            }
        }
    }

    /// Short description for logs: thread name or pid.
    pub(crate) fn describe(&self) -> String {
        match &self.unit {
            WorkerUnit::Thread { name } => name.clone(),
            WorkerUnit::Process(proc) => format!("pid {}", proc.pid()),
        }
    }
}
