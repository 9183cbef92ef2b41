//! Pool strategy: how many workers, how to spawn them, and how the pool behaves.
//!
//! # Environment Variables
//!
//! Read by [`Strategy::with_env_overrides`]:
//!
//! - `TASKPOOL_MAX_THREADS` - Number of workers
//! - `TASKPOOL_TASK_TIMEOUT_MS` - Per-task timeout in milliseconds (0 disables)
//! - `TASKPOOL_SLOT_REUSE` - `lifo` or `fifo`
//! - `TASKPOOL_ON_TERMINATE` - `reject`, `abandon` or `drain`

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::registry::ComponentRegistry;

/// Builds the registry a thread worker serves from. Called once per worker.
#[derive(Clone)]
pub struct RegistryFactory(Arc<dyn Fn() -> ComponentRegistry + Send + Sync>);

impl RegistryFactory {
    pub fn new(factory: impl Fn() -> ComponentRegistry + Send + Sync + 'static) -> Self {
        Self(Arc::new(factory))
    }

    pub fn build(&self) -> ComponentRegistry {
        (self.0)()
    }
}

impl std::fmt::Debug for RegistryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegistryFactory")
    }
}

/// Command line of a process worker.
///
/// The program must speak the worker protocol on stdin/stdout, e.g. by calling
/// [`run_worker_main`](crate::worker::run_worker_main).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessEntry {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What a worker execution unit is.
#[derive(Debug, Clone)]
pub enum WorkerEntry {
    /// An OS thread with its own registry and single-threaded runtime.
    Thread(RegistryFactory),
    /// A child process talking JSON lines over its stdin/stdout.
    Process(ProcessEntry),
}

/// Which free slot gets the next task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotReuse {
    /// Most recently freed slot first. Keeps a few warm workers busy.
    #[default]
    MostRecent,
    /// Least recently freed slot first. Spreads load across all workers.
    LeastRecent,
}

impl FromStr for SlotReuse {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lifo" | "most-recent" => Ok(Self::MostRecent),
            "fifo" | "least-recent" | "round-robin" => Ok(Self::LeastRecent),
            _ => Err(format!(
                "Unknown slot reuse policy: '{}'. Valid options: lifo, fifo",
                s
            )),
        }
    }
}

/// What `terminate()` does with tasks that have not settled yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Fail buffered and in-flight tasks with `Terminated`.
    #[default]
    Reject,
    /// Leave them unsettled for as long as the dispatcher lives.
    Abandon,
    /// Refuse new tasks, finish buffered and in-flight ones, then stop the workers.
    Drain,
}

impl FromStr for TerminationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "abandon" => Ok(Self::Abandon),
            "drain" => Ok(Self::Drain),
            _ => Err(format!(
                "Unknown termination policy: '{}'. Valid options: reject, abandon, drain",
                s
            )),
        }
    }
}

/// Pool configuration, read once when the pool starts.
#[derive(Debug, Clone)]
pub struct Strategy {
    /// Number of worker slots.
    pub max_threads: usize,
    /// How each worker is spawned.
    pub worker_entry: WorkerEntry,
    /// Free-slot selection policy.
    pub slot_reuse: SlotReuse,
    /// Reject a task and replace its worker when it runs longer than this.
    pub task_timeout: Option<Duration>,
    /// Fate of unsettled tasks on `terminate()`.
    pub on_terminate: TerminationPolicy,
    /// Delay before retrying a failed worker spawn.
    pub respawn_delay: Duration,
}

impl Strategy {
    /// Pool of thread workers, each building its registry from `factory`.
    pub fn threads(
        max_threads: usize,
        factory: impl Fn() -> ComponentRegistry + Send + Sync + 'static,
    ) -> Self {
        Self::new(max_threads, WorkerEntry::Thread(RegistryFactory::new(factory)))
    }

    /// Pool of process workers started from `entry`.
    pub fn processes(max_threads: usize, entry: ProcessEntry) -> Self {
        Self::new(max_threads, WorkerEntry::Process(entry))
    }

    pub fn new(max_threads: usize, worker_entry: WorkerEntry) -> Self {
        Self {
            max_threads,
            worker_entry,
            slot_reuse: SlotReuse::default(),
            task_timeout: None,
            on_terminate: TerminationPolicy::default(),
            respawn_delay: Duration::from_millis(500),
        }
    }

    /// One worker per available CPU.
    pub fn default_max_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_slot_reuse(mut self, slot_reuse: SlotReuse) -> Self {
        self.slot_reuse = slot_reuse;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.on_terminate = policy;
        self
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    /// Apply `TASKPOOL_*` environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("TASKPOOL_MAX_THREADS") {
            match value.parse() {
                Ok(n) => self.max_threads = n,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid TASKPOOL_MAX_THREADS"),
            }
        }

        if let Ok(value) = std::env::var("TASKPOOL_TASK_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(0) => self.task_timeout = None,
                Ok(ms) => self.task_timeout = Some(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!(value = %value, "Ignoring invalid TASKPOOL_TASK_TIMEOUT_MS")
                }
            }
        }

        if let Ok(value) = std::env::var("TASKPOOL_SLOT_REUSE") {
            match value.parse() {
                Ok(reuse) => self.slot_reuse = reuse,
                Err(e) => tracing::warn!(error = %e, "Ignoring TASKPOOL_SLOT_REUSE"),
            }
        }

        if let Ok(value) = std::env::var("TASKPOOL_ON_TERMINATE") {
            match value.parse() {
                Ok(policy) => self.on_terminate = policy,
                Err(e) => tracing::warn!(error = %e, "Ignoring TASKPOOL_ON_TERMINATE"),
            }
        }

        self
    }

    /// Check the strategy before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(DispatchError::InvalidStrategy(
                "max_threads must be greater than 0".to_string(),
            ));
        }
        if let Some(timeout) = self.task_timeout
            && timeout.is_zero()
        {
            return Err(DispatchError::InvalidStrategy(
                "task_timeout must be greater than 0".to_string(),
            ));
        }
        if let WorkerEntry::Process(entry) = &self.worker_entry
            && entry.program.as_os_str().is_empty()
        {
            return Err(DispatchError::InvalidStrategy(
                "process worker program is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thread_strategy(n: usize) -> Strategy {
        Strategy::threads(n, ComponentRegistry::new)
    }

    fn clear_env() {
        // Safety: tests touching the environment are serialized.
        unsafe {
            std::env::remove_var("TASKPOOL_MAX_THREADS");
            std::env::remove_var("TASKPOOL_TASK_TIMEOUT_MS");
            std::env::remove_var("TASKPOOL_SLOT_REUSE");
            std::env::remove_var("TASKPOOL_ON_TERMINATE");
        }
    }

    #[test]
    fn test_strategy_defaults() {
        let strategy = thread_strategy(3);
        assert_eq!(strategy.max_threads, 3);
        assert_eq!(strategy.slot_reuse, SlotReuse::MostRecent);
        assert_eq!(strategy.on_terminate, TerminationPolicy::Reject);
        assert!(strategy.task_timeout.is_none());
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let err = thread_strategy(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_threads"));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let err = thread_strategy(1)
            .with_task_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("task_timeout"));
    }

    #[test]
    fn test_empty_program_is_invalid() {
        let strategy = Strategy::processes(2, ProcessEntry::new(""));
        assert!(strategy.validate().is_err());
    }

    #[test]
    fn test_process_entry_builder() {
        let entry = ProcessEntry::new("/usr/bin/taskpool")
            .arg("worker")
            .env("TASKPOOL_LOG", "debug");
        assert_eq!(entry.args, vec!["worker"]);
        assert_eq!(entry.env, vec![("TASKPOOL_LOG".into(), "debug".into())]);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("lifo".parse::<SlotReuse>().unwrap(), SlotReuse::MostRecent);
        assert_eq!("FIFO".parse::<SlotReuse>().unwrap(), SlotReuse::LeastRecent);
        assert!("random".parse::<SlotReuse>().is_err());

        assert_eq!(
            "drain".parse::<TerminationPolicy>().unwrap(),
            TerminationPolicy::Drain
        );
        assert_eq!(
            "Abandon".parse::<TerminationPolicy>().unwrap(),
            TerminationPolicy::Abandon
        );
        assert!("explode".parse::<TerminationPolicy>().is_err());
    }

    #[test]
    #[serial(env)]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("TASKPOOL_MAX_THREADS", "7");
            std::env::set_var("TASKPOOL_TASK_TIMEOUT_MS", "250");
            std::env::set_var("TASKPOOL_SLOT_REUSE", "fifo");
            std::env::set_var("TASKPOOL_ON_TERMINATE", "drain");
        }

        let strategy = thread_strategy(2).with_env_overrides();
        assert_eq!(strategy.max_threads, 7);
        assert_eq!(strategy.task_timeout, Some(Duration::from_millis(250)));
        assert_eq!(strategy.slot_reuse, SlotReuse::LeastRecent);
        assert_eq!(strategy.on_terminate, TerminationPolicy::Drain);

        clear_env();
    }

    #[test]
    #[serial(env)]
    fn test_invalid_env_values_are_ignored() {
        clear_env();
        unsafe {
            std::env::set_var("TASKPOOL_MAX_THREADS", "many");
            std::env::set_var("TASKPOOL_TASK_TIMEOUT_MS", "0");
        }

        let strategy = thread_strategy(2)
            .with_task_timeout(Duration::from_secs(1))
            .with_env_overrides();
        assert_eq!(strategy.max_threads, 2);
        assert!(strategy.task_timeout.is_none());

        clear_env();
    }

    /// Counts WARN events.
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    #[serial(env)]
    fn test_invalid_policies_warn_and_keep_defaults() {
        use tracing_subscriber::layer::SubscriberExt;

        clear_env();
        unsafe {
            std::env::set_var("TASKPOOL_SLOT_REUSE", "random");
            std::env::set_var("TASKPOOL_ON_TERMINATE", "explode");
        }

        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        let strategy =
            tracing::subscriber::with_default(subscriber, || thread_strategy(2).with_env_overrides());
        clear_env();

        assert_eq!(strategy.slot_reuse, SlotReuse::MostRecent);
        assert_eq!(strategy.on_terminate, TerminationPolicy::Reject);
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }
}
