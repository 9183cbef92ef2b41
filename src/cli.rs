//! Command-line interface definitions using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use taskpool::logging::{LogConfig, LogFormat};
use taskpool::{ProcessEntry, SlotReuse, Strategy, TerminationPolicy, demo};

/// Run component method calls on a pool of worker threads or processes.
#[derive(Parser, Debug)]
#[command(name = "taskpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pool over the built-in calculator and push random additions through it.
    Run(RunArgs),

    /// Serve the built-in components as a process worker on stdin/stdout.
    #[command(hide = true)]
    Worker,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of workers.
    #[arg(short, long, env = "TASKPOOL_MAX_THREADS", default_value_t = Strategy::default_max_threads())]
    pub workers: usize,

    /// Number of tasks to submit.
    #[arg(short = 'n', long, default_value_t = 100)]
    pub tasks: usize,

    /// Kind of worker execution unit.
    #[arg(short, long, value_enum, default_value_t = WorkerMode::Thread)]
    pub mode: WorkerMode,

    /// Reject tasks running longer than this many milliseconds.
    #[arg(long, env = "TASKPOOL_TASK_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Which free worker gets the next task.
    #[arg(long, value_enum, env = "TASKPOOL_SLOT_REUSE", default_value_t = ReuseArg::Lifo)]
    pub reuse: ReuseArg,

    /// What happens to unsettled tasks on shutdown.
    #[arg(long, value_enum, env = "TASKPOOL_ON_TERMINATE", default_value_t = OnTerminateArg::Reject)]
    pub on_terminate: OnTerminateArg,

    /// Replace every Nth task with one that crashes its worker.
    #[arg(long, value_name = "N")]
    pub crash_every: Option<usize>,

    /// Use ASCII table borders instead of Unicode.
    #[arg(long)]
    pub ascii: bool,
}

impl RunArgs {
    /// Build the pool strategy for these arguments.
    pub fn strategy(&self) -> std::io::Result<Strategy> {
        let strategy = match self.mode {
            WorkerMode::Thread => Strategy::threads(self.workers, demo::registry),
            WorkerMode::Process => {
                let exe = std::env::current_exe()?;
                Strategy::processes(self.workers, ProcessEntry::new(exe).arg("worker"))
            }
        };

        let mut strategy = strategy
            .with_slot_reuse(self.reuse.into())
            .with_termination_policy(self.on_terminate.into());
        if let Some(ms) = self.timeout_ms.filter(|ms| *ms > 0) {
            strategy = strategy.with_task_timeout(Duration::from_millis(ms));
        }
        Ok(strategy)
    }
}

/// Worker execution unit.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// OS threads inside this process.
    #[default]
    Thread,
    /// Child processes running `taskpool worker`.
    Process,
}

/// Free-slot selection policy.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReuseArg {
    /// Most recently freed worker first.
    #[default]
    Lifo,
    /// Least recently freed worker first.
    Fifo,
}

impl From<ReuseArg> for SlotReuse {
    fn from(arg: ReuseArg) -> Self {
        match arg {
            ReuseArg::Lifo => SlotReuse::MostRecent,
            ReuseArg::Fifo => SlotReuse::LeastRecent,
        }
    }
}

/// Termination policy.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnTerminateArg {
    /// Reject unsettled tasks.
    #[default]
    Reject,
    /// Leave unsettled tasks pending.
    Abandon,
    /// Finish accepted tasks first.
    Drain,
}

impl From<OnTerminateArg> for TerminationPolicy {
    fn from(arg: OnTerminateArg) -> Self {
        match arg {
            OnTerminateArg::Reject => TerminationPolicy::Reject,
            OnTerminateArg::Abandon => TerminationPolicy::Abandon,
            OnTerminateArg::Drain => TerminationPolicy::Drain,
        }
    }
}

/// Log format argument.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Logging configuration from the global flags.
    ///
    /// Flags win over `TASKPOOL_LOG*` environment variables.
    pub fn log_config(&self) -> LogConfig {
        let base = match self.command {
            Commands::Worker => LogConfig::for_worker(),
            Commands::Run(_) => LogConfig::for_coordinator().with_level(Level::WARN),
        };

        let level = match (self.quiet, self.verbose) {
            (true, _) => Some(Level::ERROR),
            (false, 0) => None,
            (false, 1) => Some(Level::INFO),
            (false, 2) => Some(Level::DEBUG),
            (false, _) => Some(Level::TRACE),
        };

        let mut config = match level {
            Some(level) => base
                .with_level(level)
                .with_filter(level.to_string().to_lowercase()),
            None => base,
        }
        .with_env_overrides();

        if let Some(format) = self.log_format {
            config = config.with_format(format.into());
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }
}
