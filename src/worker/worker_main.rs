//! Worker-side execution.
//!
//! [`ExecutionAdapter`] is what runs inside every worker, thread or process: it takes
//! a dispatch request, resolves the component in the worker's own registry, awaits
//! the method and turns the outcome into a response. [`run_worker_main`] wraps it in
//! the stdin/stdout loop used by process workers.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{SerializedError, WorkRequest, WorkResponse};
use crate::context;
use crate::registry::ComponentRegistry;

/// Executes dispatched calls against a worker's registry.
#[derive(Debug, Clone)]
pub struct ExecutionAdapter {
    registry: Arc<ComponentRegistry>,
}

impl ExecutionAdapter {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Run one call and describe its outcome.
    ///
    /// Never fails: unknown components, unknown methods, bad arguments and method
    /// errors all come back as [`WorkResponse::Error`].
    pub async fn execute(
        &self,
        component_id: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> WorkResponse {
        trace!(component = component_id, method = method_name, "Executing");
        let outcome = match self.registry.invoke(component_id, method_name, args) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => WorkResponse::result(result),
            Err(error) => {
                debug!(
                    component = component_id,
                    method = method_name,
                    error = %error,
                    "Method failed"
                );
                WorkResponse::error(error)
            }
        }
    }
}

/// Process worker main loop.
///
/// Reads requests from `reader`, executes them, and writes responses to `writer`.
fn worker_loop(
    registry: ComponentRegistry,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let registry = Arc::new(registry);
    let _scope = context::enter_worker(Arc::clone(&registry));
    let adapter = ExecutionAdapter::new(registry);

    writer.write_message(&WorkResponse::Ready)?;

    loop {
        let request = match reader.read_message::<WorkRequest>() {
            Ok(Some(request)) => request,
            // EOF - parent closed the pipe
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let error = SerializedError::new(format!("Invalid request: {}", e));
                writer.write_message(&WorkResponse::error(error))?;
                continue;
            }
            Err(e) => return Err(e),
        };

        match request {
            WorkRequest::Exit => return Ok(()),
            WorkRequest::Dispatch {
                component_id,
                method_name,
                args,
            } => {
                let response =
                    runtime.block_on(adapter.execute(&component_id, &method_name, args));
                writer.write_message(&response)?;
            }
        }
    }
}

/// Run the process worker main function.
///
/// Serves `registry` over stdin/stdout until the parent sends `exit` or closes the
/// pipe. Never returns. Anything the components print to stdout corrupts the
/// protocol, so logging must go to stderr.
pub fn run_worker_main(registry: ComponentRegistry) -> ! {
    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: file descriptors 0 and 1 are always valid for stdin/stdout
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);

    match worker_loop(registry, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
