//! Thread workers.
//!
//! Each thread worker is a named OS thread with its own current-thread tokio runtime
//! and its own registry built from the strategy's factory. A panic anywhere in the
//! worker, including inside a component method, ends the thread and is reported as a
//! crash.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::pool::{SlotId, WorkerEvent};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, panic_message};
use super::worker_main::ExecutionAdapter;
use crate::context;
use crate::error::{DispatchError, Result};
use crate::strategy::RegistryFactory;

/// Start a thread worker for `slot`.
///
/// Returns the thread name and the sender feeding its request loop.
pub(crate) fn spawn_thread(
    factory: &RegistryFactory,
    slot: SlotId,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<(String, mpsc::UnboundedSender<WorkRequest>)> {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let factory = factory.clone();
    let name = format!("taskpool-worker-{}", slot.get());

    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                serve(&factory, slot, requests_rx, &events)
            }));
            let reason = match outcome {
                Ok(Ok(())) => TerminationReason::Exited(0),
                Ok(Err(e)) => {
                    warn!(slot = %slot, error = %e, "Worker failed to start");
                    TerminationReason::Unknown
                }
                Err(payload) => TerminationReason::Panicked(panic_message(payload.as_ref())),
            };
            let _ = events.send(WorkerEvent::Exited { slot, reason });
        })
        .map_err(|e| DispatchError::Spawn(format!("Failed to start worker thread: {}", e)))?;

    Ok((name, requests_tx))
}

fn serve(
    factory: &RegistryFactory,
    slot: SlotId,
    mut requests: mpsc::UnboundedReceiver<WorkRequest>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let registry = Arc::new(factory.build());
    let _scope = context::enter_worker(Arc::clone(&registry));
    let adapter = ExecutionAdapter::new(registry);

    let ready = WorkerEvent::Message {
        slot,
        response: WorkResponse::Ready,
    };
    if events.send(ready).is_err() {
        return Ok(());
    }

    runtime.block_on(async {
        while let Some(request) = requests.recv().await {
            match request {
                WorkRequest::Exit => break,
                WorkRequest::Dispatch {
                    component_id,
                    method_name,
                    args,
                } => {
                    let response = adapter.execute(&component_id, &method_name, args).await;
                    if events.send(WorkerEvent::Message { slot, response }).is_err() {
                        // Coordinator is gone
                        break;
                    }
                }
            }
        }
    });
    trace!(slot = %slot, "Worker thread exiting");
    Ok(())
}
