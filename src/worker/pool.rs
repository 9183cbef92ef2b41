//! Pool coordinator.
//!
//! The coordinator is a single tokio task that owns every worker slot, the free list
//! and the pending buffer. Dispatcher handles talk to it through [`Command`]s; worker
//! units talk to it through [`WorkerEvent`]s. Since nothing else touches the pool
//! state it needs no locks, and every transition below happens on one task.
//!
//! Slot lifecycle: spawned (not ready) -> ready and free -> busy -> free ... until
//! the unit exits. A slot that exits while the pool is running is replaced
//! immediately, and its in-flight task is rejected with a crash error.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, WorkerFailure};
use super::spawn::{WorkerHandle, spawn_worker};
use crate::context::ContextToken;
use crate::error::{DispatchError, Result};
use crate::strategy::{SlotReuse, Strategy, TerminationPolicy, WorkerEntry};

/// Identifier of a worker slot. Replacements get fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskId(u64);

/// Where a task's outcome goes.
pub(crate) type Completion = oneshot::Sender<Result<Value>>;

/// A task accepted by the dispatcher but not yet assigned to a worker.
pub(crate) struct PendingTask {
    pub component_id: String,
    pub method_name: String,
    pub args: Vec<Value>,
    pub reply: Completion,
    pub context: ContextToken,
}

impl PendingTask {
    fn reject(self, err: DispatchError) {
        let Self {
            component_id,
            method_name,
            reply,
            context,
            ..
        } = self;
        context.restore(|| {
            debug!(component = %component_id, method = %method_name, error = %err, "Task rejected");
            let _ = reply.send(Err(err));
        });
    }
}

/// A task running on a worker.
struct TaskHandle {
    id: TaskId,
    label: String,
    context: ContextToken,
    reply: Completion,
    started: Instant,
}

impl TaskHandle {
    /// Settle the task inside the caller's context.
    fn complete(self, outcome: Result<Value>) {
        let Self {
            id,
            label,
            context,
            reply,
            started,
        } = self;
        context.restore(|| {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                Ok(_) => debug!(task = id.0, task_label = %label, elapsed_ms, "Task completed"),
                Err(e) => debug!(task = id.0, task_label = %label, elapsed_ms, error = %e, "Task failed"),
            }
            // The caller may have dropped its future
            let _ = reply.send(outcome);
        });
    }
}

/// Requests from dispatcher handles.
pub(crate) enum Command {
    Run(PendingTask),
    Stats(oneshot::Sender<PoolStats>),
    Terminate,
}

/// Notifications from worker units and timers.
pub(crate) enum WorkerEvent {
    Message {
        slot: SlotId,
        response: WorkResponse,
    },
    Exited {
        slot: SlotId,
        reason: TerminationReason,
    },
    TimedOut {
        slot: SlotId,
        task: TaskId,
    },
    Respawn,
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker slots, including ones still starting.
    pub worker_count: usize,
    /// Ready slots without a task.
    pub idle: usize,
    /// Slots running a task.
    pub busy: usize,
    /// Slots that have not signalled ready yet.
    pub starting: usize,
    /// Tasks waiting for a free slot.
    pub pending: usize,
    /// Tasks that returned a value.
    pub completed: u64,
    /// Tasks that settled with an error of any kind.
    pub failed: u64,
    /// Workers that exited while the pool was running.
    pub crashed: u64,
    /// Replacement workers spawned.
    pub respawned: u64,
    /// Tasks rejected for exceeding the task timeout.
    pub timed_out: u64,
}

struct WorkerSlot {
    handle: WorkerHandle,
    current_task: Option<TaskHandle>,
    ready: bool,
    spawned: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    /// Terminated with the drain policy; finishing what was accepted.
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    crashed: u64,
    respawned: u64,
    timed_out: u64,
}

pub(crate) struct Coordinator {
    strategy: Strategy,
    slots: HashMap<SlotId, WorkerSlot>,
    /// Ready idle slots, most recently freed at the back.
    free: VecDeque<SlotId>,
    pending: VecDeque<PendingTask>,
    /// In-flight tasks abandoned by `terminate()`; dropped on shutdown.
    parked: Vec<TaskHandle>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: PoolState,
    next_slot: u64,
    next_task: u64,
    counters: Counters,
}

impl Coordinator {
    pub(crate) fn new(strategy: Strategy, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            strategy,
            slots: HashMap::new(),
            free: VecDeque::new(),
            pending: VecDeque::new(),
            parked: Vec::new(),
            events,
            state: PoolState::Running,
            next_slot: 1,
            next_task: 1,
            counters: Counters::default(),
        }
    }

    /// Spawn the initial `max_threads` workers.
    pub(crate) fn fill(&mut self) -> Result<()> {
        for _ in 0..self.strategy.max_threads {
            self.spawn_slot()?;
        }
        Ok(())
    }

    /// Stop whatever [`fill`](Self::fill) managed to start.
    pub(crate) fn abort(mut self) {
        self.stop_workers();
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every dispatcher handle is gone
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Run(task) => self.submit(task),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Terminate => self.terminate(),
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { slot, response } => self.on_message(slot, response),
            WorkerEvent::Exited { slot, reason } => self.on_exit(slot, reason),
            WorkerEvent::TimedOut { slot, task } => self.on_timeout(slot, task),
            WorkerEvent::Respawn => {
                if self.wants_workers() && self.slots.len() < self.strategy.max_threads {
                    self.replace_slot(false);
                }
            }
        }
    }

    fn submit(&mut self, task: PendingTask) {
        if self.state != PoolState::Running {
            task.reject(DispatchError::Terminated);
            return;
        }
        match self.take_free_slot() {
            Some(slot) => self.dispatch(slot, task),
            None => {
                trace!(pending = self.pending.len() + 1, "No free worker, buffering task");
                self.pending.push_back(task);
            }
        }
    }

    fn take_free_slot(&mut self) -> Option<SlotId> {
        match self.strategy.slot_reuse {
            SlotReuse::MostRecent => self.free.pop_back(),
            SlotReuse::LeastRecent => self.free.pop_front(),
        }
    }

    fn dispatch(&mut self, slot_id: SlotId, task: PendingTask) {
        let PendingTask {
            component_id,
            method_name,
            args,
            reply,
            context,
        } = task;
        let label = format!("{}.{}", component_id, method_name);
        let request = WorkRequest::dispatch(component_id, method_name, args);

        let sent = match self.slots.get(&slot_id) {
            Some(slot) => slot.handle.send(request),
            None => Err(request),
        };
        if let Err(request) = sent {
            // The unit is gone but its exit has not been observed yet
            warn!(slot = %slot_id, "Worker stopped accepting requests");
            if let WorkRequest::Dispatch {
                component_id,
                method_name,
                args,
            } = request
            {
                self.pending.push_front(PendingTask {
                    component_id,
                    method_name,
                    args,
                    reply,
                    context,
                });
            }
            self.on_exit(slot_id, TerminationReason::Disconnected);
            return;
        }

        let id = TaskId(self.next_task);
        self.next_task += 1;
        context.restore(|| trace!(slot = %slot_id, task = id.0, task_label = %label, "Dispatched task"));

        if let Some(timeout) = self.strategy.task_timeout {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(WorkerEvent::TimedOut {
                    slot: slot_id,
                    task: id,
                });
            });
        }

        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.current_task = Some(TaskHandle {
                id,
                label,
                context,
                reply,
                started: Instant::now(),
            });
        }
    }

    fn on_message(&mut self, slot_id: SlotId, response: WorkResponse) {
        let Some(slot) = self.slots.get_mut(&slot_id) else {
            trace!(slot = %slot_id, "Ignoring message from retired worker");
            return;
        };
        match response {
            WorkResponse::Ready => {
                if slot.ready {
                    warn!(slot = %slot_id, "Duplicate ready signal");
                    return;
                }
                slot.ready = true;
                debug!(
                    slot = %slot_id,
                    worker = %slot.handle.describe(),
                    startup_ms = slot.spawned.elapsed().as_millis() as u64,
                    "Worker ready"
                );
                self.release(slot_id);
            }
            WorkResponse::Result { result } => self.finish(slot_id, Ok(result)),
            WorkResponse::Error { error } => self.finish(slot_id, Err(DispatchError::Task(error))),
        }
    }

    fn finish(&mut self, slot_id: SlotId, outcome: Result<Value>) {
        let Some(task) = self
            .slots
            .get_mut(&slot_id)
            .and_then(|slot| slot.current_task.take())
        else {
            if self.state == PoolState::Stopped {
                // Late reply for a task settled by terminate()
                trace!(slot = %slot_id, "Ignoring reply after stop");
            } else {
                warn!(slot = %slot_id, "Worker replied without a task in flight");
            }
            return;
        };
        match outcome {
            Ok(_) => self.counters.completed += 1,
            Err(_) => self.counters.failed += 1,
        }
        task.complete(outcome);
        self.release(slot_id);
    }

    /// Put a ready, idle slot back on the free list and hand it pending work.
    fn release(&mut self, slot_id: SlotId) {
        if self.state == PoolState::Stopped {
            // Already told to exit
            return;
        }
        self.free.push_back(slot_id);
        self.drain_pending();
        self.maybe_finish_drain();
    }

    fn drain_pending(&mut self) {
        while !self.pending.is_empty() {
            let Some(slot) = self.take_free_slot() else {
                break;
            };
            if let Some(task) = self.pending.pop_front() {
                self.dispatch(slot, task);
            }
        }
    }

    fn on_exit(&mut self, slot_id: SlotId, reason: TerminationReason) {
        let Some(slot) = self.slots.remove(&slot_id) else {
            trace!(slot = %slot_id, reason = %reason, "Ignoring exit of retired worker");
            return;
        };
        self.free.retain(|id| *id != slot_id);

        if self.state == PoolState::Stopped {
            trace!(slot = %slot_id, reason = %reason, "Worker stopped");
            return;
        }

        self.counters.crashed += 1;
        let mut failure = WorkerFailure::new(reason.clone());
        if let Some(task) = &slot.current_task {
            failure = failure.with_context(format!("running {}", task.label));
        }
        warn!(
            slot = %slot_id,
            worker = %slot.handle.describe(),
            reason = %reason,
            "{}",
            failure
        );

        if let Some(task) = slot.current_task {
            self.counters.failed += 1;
            task.complete(Err(DispatchError::WorkerCrashed {
                slot: slot_id,
                reason,
            }));
        }

        if self.wants_workers() {
            // A worker that never got ready is likely to fail the same way again
            self.replace_slot(!slot.ready);
        }
        self.maybe_finish_drain();
    }

    fn on_timeout(&mut self, slot_id: SlotId, task_id: TaskId) {
        let matches = self
            .slots
            .get(&slot_id)
            .and_then(|slot| slot.current_task.as_ref())
            .is_some_and(|task| task.id == task_id);
        if !matches {
            // Settled before the timer fired
            return;
        }
        let Some(mut slot) = self.slots.remove(&slot_id) else {
            return;
        };
        let timeout = self.strategy.task_timeout.unwrap_or_default();

        if let Some(task) = slot.current_task.take() {
            warn!(
                slot = %slot_id,
                task_label = %task.label,
                timeout_ms = timeout.as_millis() as u64,
                "Task timed out, replacing worker"
            );
            self.counters.timed_out += 1;
            self.counters.failed += 1;
            task.complete(Err(DispatchError::TimedOut(timeout)));
        }
        slot.handle.kill();

        if self.wants_workers() {
            self.replace_slot(false);
        }
        self.maybe_finish_drain();
    }

    fn spawn_slot(&mut self) -> Result<SlotId> {
        let slot_id = SlotId(self.next_slot);
        self.next_slot += 1;
        let handle = spawn_worker(&self.strategy.worker_entry, slot_id, self.events.clone())?;
        debug!(slot = %slot_id, worker = %handle.describe(), "Spawned worker");
        self.slots.insert(
            slot_id,
            WorkerSlot {
                handle,
                current_task: None,
                ready: false,
                spawned: Instant::now(),
            },
        );
        Ok(slot_id)
    }

    fn replace_slot(&mut self, delayed: bool) {
        if delayed {
            self.schedule_respawn();
            return;
        }
        match self.spawn_slot() {
            Ok(slot_id) => {
                self.counters.respawned += 1;
                info!(slot = %slot_id, "Replacement worker spawned");
            }
            Err(e) => {
                error!(
                    error = %e,
                    retry_ms = self.strategy.respawn_delay.as_millis() as u64,
                    "Failed to spawn replacement worker"
                );
                self.schedule_respawn();
            }
        }
    }

    fn schedule_respawn(&self) {
        let events = self.events.clone();
        let delay = self.strategy.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(WorkerEvent::Respawn);
        });
    }

    fn wants_workers(&self) -> bool {
        match self.state {
            PoolState::Running => true,
            PoolState::Draining => !self.pending.is_empty(),
            PoolState::Stopped => false,
        }
    }

    fn terminate(&mut self) {
        if self.state == PoolState::Stopped {
            return;
        }
        match self.strategy.on_terminate {
            TerminationPolicy::Drain => {
                if self.state == PoolState::Running {
                    info!(
                        in_flight = self.busy_count(),
                        pending = self.pending.len(),
                        "Draining worker pool"
                    );
                    self.state = PoolState::Draining;
                }
                self.maybe_finish_drain();
            }
            TerminationPolicy::Reject => {
                self.stop_workers();
                let in_flight: Vec<TaskHandle> = self
                    .slots
                    .values_mut()
                    .filter_map(|slot| slot.current_task.take())
                    .collect();
                for task in in_flight {
                    self.counters.failed += 1;
                    task.complete(Err(DispatchError::Terminated));
                }
                for task in std::mem::take(&mut self.pending) {
                    task.reject(DispatchError::Terminated);
                }
            }
            TerminationPolicy::Abandon => {
                self.stop_workers();
                let in_flight = self
                    .slots
                    .values_mut()
                    .filter_map(|slot| slot.current_task.take());
                self.parked.extend(in_flight);
                debug!(
                    parked = self.parked.len(),
                    pending = self.pending.len(),
                    "Abandoning unsettled tasks"
                );
            }
        }
    }

    fn maybe_finish_drain(&mut self) {
        if self.state == PoolState::Draining && self.pending.is_empty() && self.busy_count() == 0 {
            info!("Worker pool drained");
            self.stop_workers();
        }
    }

    fn stop_workers(&mut self) {
        if self.state != PoolState::Stopped {
            info!(workers = self.slots.len(), "Stopping workers");
        }
        self.state = PoolState::Stopped;
        self.free.clear();
        for slot in self.slots.values_mut() {
            slot.handle.stop();
        }
    }

    fn shutdown(&mut self) {
        self.stop_workers();
        let dropped = self.pending.len() + self.parked.len();
        if dropped > 0 {
            debug!(dropped, "Dropping unsettled tasks");
        }
        // Dropping the completions settles their futures as terminated
        self.pending.clear();
        self.parked.clear();
        trace!("Coordinator exited");
    }

    fn busy_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.current_task.is_some())
            .count()
    }

    fn stats(&self) -> PoolStats {
        let busy = self.busy_count();
        let starting = self.slots.values().filter(|slot| !slot.ready).count();
        PoolStats {
            worker_count: self.slots.len(),
            idle: self.free.len(),
            busy,
            starting,
            pending: self.pending.len(),
            completed: self.counters.completed,
            failed: self.counters.failed,
            crashed: self.counters.crashed,
            respawned: self.counters.respawned,
            timed_out: self.counters.timed_out,
        }
    }

    /// Worker kind, for logs.
    pub(crate) fn mode(&self) -> &'static str {
        match self.strategy.worker_entry {
            WorkerEntry::Thread(_) => "thread",
            WorkerEntry::Process(_) => "process",
        }
    }
}
