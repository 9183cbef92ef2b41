//! Process workers.
//!
//! A process worker is a child spawned from a [`ProcessEntry`] with piped stdin and
//! stdout. Two helper threads bridge it to the coordinator: the writer drains the
//! slot's request channel into the child's stdin, and the reader forwards every
//! response line as a [`WorkerEvent`]. When stdout closes the reader reaps the child
//! and reports why it went away.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::pool::{SlotId, WorkerEvent};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{DispatchError, Result};
use crate::strategy::ProcessEntry;

/// Environment variable carrying the slot id into the child.
pub const SLOT_ENV: &str = "TASKPOOL_WORKER_SLOT";

/// Handle to a worker subprocess.
#[derive(Debug)]
pub(crate) struct Proc {
    pid: Pid,
    /// Set once the reader thread has reaped the child.
    reaped: Arc<AtomicBool>,
}

impl Proc {
    /// Spawn the child and its bridge threads.
    ///
    /// Returns the handle plus the sender feeding the child's stdin.
    pub(crate) fn spawn(
        entry: &ProcessEntry,
        slot: SlotId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(Self, mpsc::UnboundedSender<WorkRequest>)> {
        let mut cmd = Command::new(&entry.program);
        cmd.args(&entry.args);
        cmd.envs(entry.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.env(SLOT_ENV, slot.get().to_string());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker logs go to parent's stderr

        let mut child = cmd.spawn().map_err(|e| {
            DispatchError::Spawn(format!("{}: {}", entry.program.display(), e))
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Spawn("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Spawn("Child stdout not captured".into()))?;
        // Reaped by the reader thread through waitpid
        drop(child);

        let proc = Self {
            pid,
            reaped: Arc::new(AtomicBool::new(false)),
        };

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let writer = LineWriter::new(PipeFd::from(stdin));
        if let Err(e) = std::thread::Builder::new()
            .name(format!("taskpool-writer-{}", slot.get()))
            .spawn(move || write_requests(slot, writer, requests_rx))
        {
            let _ = proc.kill();
            return Err(DispatchError::Spawn(format!(
                "Failed to start writer thread: {}",
                e
            )));
        }

        let reader = LineReader::new(PipeFd::from(stdout));
        let reaped = Arc::clone(&proc.reaped);
        if let Err(e) = std::thread::Builder::new()
            .name(format!("taskpool-reader-{}", slot.get()))
            .spawn(move || read_responses(slot, pid, reader, reaped, events))
        {
            let _ = proc.kill();
            return Err(DispatchError::Spawn(format!(
                "Failed to start reader thread: {}",
                e
            )));
        }

        Ok((proc, requests_tx))
    }

    /// Get the process ID.
    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    /// Send SIGKILL to the process.
    ///
    /// The reader thread observes the resulting EOF and reaps it.
    pub(crate) fn kill(&self) -> Result<()> {
        if self.reaped.load(Ordering::Acquire) {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| DispatchError::Spawn(format!("Failed to send SIGKILL: {}", e)))
    }
}

fn write_requests(
    slot: SlotId,
    mut writer: LineWriter,
    mut requests: mpsc::UnboundedReceiver<WorkRequest>,
) {
    while let Some(request) = requests.blocking_recv() {
        let is_exit = matches!(request, WorkRequest::Exit);
        if let Err(e) = writer.write_message(&request) {
            debug!(slot = %slot, error = %e, "Worker stdin closed");
            break;
        }
        if is_exit {
            break;
        }
    }
    // Dropping the writer closes stdin, which a worker treats as a request to exit
}

fn read_responses(
    slot: SlotId,
    pid: Pid,
    mut reader: LineReader,
    reaped: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        match reader.read_message::<WorkResponse>() {
            Ok(Some(response)) => {
                if events.send(WorkerEvent::Message { slot, response }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(slot = %slot, error = %e, "Ignoring malformed line from worker");
            }
            Err(e) => {
                warn!(slot = %slot, error = %e, "Failed to read from worker");
                break;
            }
        }
    }

    let reason = match waitpid(pid, None) {
        Ok(status) => analyze_wait_status(status),
        Err(e) => {
            debug!(slot = %slot, pid = pid.as_raw(), error = %e, "waitpid failed");
            TerminationReason::Unknown
        }
    };
    reaped.store(true, Ordering::Release);
    trace!(slot = %slot, pid = pid.as_raw(), reason = %reason, "Worker process reaped");
    let _ = events.send(WorkerEvent::Exited { slot, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let entry = ProcessEntry::new("/nonexistent/taskpool-worker");
        let err = Proc::spawn(&entry, SlotId::new(1), events_tx).unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_exit_is_reported_with_status() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let entry = ProcessEntry::new("sh").arg("-c").arg("exit 3");
        let (_proc, _requests) = Proc::spawn(&entry, SlotId::new(2), events_tx).unwrap();

        match next_event(&mut events_rx).await {
            WorkerEvent::Exited { slot, reason } => {
                assert_eq!(slot, SlotId::new(2));
                assert_eq!(reason, TerminationReason::Exited(3));
            }
            _ => panic!("expected exit event"),
        }
    }

    #[tokio::test]
    async fn test_lines_are_forwarded_as_messages() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let entry = ProcessEntry::new("sh")
            .arg("-c")
            .arg(r#"echo '{"type":"ready"}'; echo garbage; echo '{"type":"result","result":5}'"#);
        let (_proc, _requests) = Proc::spawn(&entry, SlotId::new(3), events_tx).unwrap();

        let WorkerEvent::Message { response, .. } = next_event(&mut events_rx).await else {
            panic!("expected ready message");
        };
        assert_eq!(response, WorkResponse::Ready);

        let WorkerEvent::Message { response, .. } = next_event(&mut events_rx).await else {
            panic!("expected result message");
        };
        assert_eq!(response, WorkResponse::result(serde_json::json!(5)));

        assert!(matches!(
            next_event(&mut events_rx).await,
            WorkerEvent::Exited { .. }
        ));
    }

    #[tokio::test]
    async fn test_kill_is_reported() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let entry = ProcessEntry::new("sleep").arg("30");
        let (proc, _requests) = Proc::spawn(&entry, SlotId::new(4), events_tx).unwrap();
        assert!(proc.pid().as_raw() > 0);

        proc.kill().unwrap();
        match next_event(&mut events_rx).await {
            WorkerEvent::Exited { reason, .. } => assert!(!reason.is_success()),
            _ => panic!("expected exit event"),
        }
    }
}
