//! Logging setup for the coordinator and for process workers.
//!
//! Process workers use stdout as their protocol channel, so every layer built here
//! writes to stderr (plus an optional rolling file).
//!
//! # Environment Variables
//!
//! - `TASKPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `TASKPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `TASKPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `TASKPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `TASKPOOL_LOG_ROTATION` - File rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use taskpool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_coordinator().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event, for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration. Pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level, used when no filter is set
    pub level: Level,
    pub format: LogFormat,
    /// Also log to this file
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Filter directives, e.g. `taskpool=debug` (overrides `level`)
    pub filter: Option<String>,
    pub show_target: bool,
    /// Worker threads are named `taskpool-worker-<slot>`
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the process that owns the pool.
    pub fn for_coordinator() -> Self {
        Self {
            show_thread_names: true,
            ..Self::default()
        }
    }

    /// Preset for process workers: compact lines on stderr, warnings and up.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply `TASKPOOL_LOG*` environment variable overrides.
    ///
    /// A filter set from the command line wins over `TASKPOOL_LOG`, `RUST_LOG` and
    /// `TASKPOOL_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("TASKPOOL_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("TASKPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("TASKPOOL_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("TASKPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Ok(rotation) = std::env::var("TASKPOOL_LOG_ROTATION")
            && let Ok(rotation) = rotation.parse()
        {
            self.rotation = rotation;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer writing to `writer`.
    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().with_current_span(true).boxed(),
            LogFormat::Compact => layer
                .compact()
                .with_thread_names(self.show_thread_names)
                .boxed(),
            LogFormat::Pretty => layer.with_thread_names(self.show_thread_names).boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("taskpool.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Install the global tracing subscriber.
///
/// Logs to stderr, and to `config.file_path` as well when set. Only the first call
/// in a process has an effect.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.layer(file_appender(path, config.rotation), false));
    }

    // Already initialized is fine
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        // Safety: tests touching the environment are serialized.
        unsafe {
            for key in [
                "TASKPOOL_LOG",
                "RUST_LOG",
                "TASKPOOL_LOG_LEVEL",
                "TASKPOOL_LOG_FORMAT",
                "TASKPOOL_LOG_FILE",
                "TASKPOOL_LOG_ROTATION",
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Compact.to_string(), "compact");
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_worker_preset_is_quiet_and_compact() {
        let config = LogConfig::for_worker();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.file_path.is_none());
    }

    #[test]
    fn test_coordinator_preset_shows_threads() {
        let config = LogConfig::for_coordinator();
        assert_eq!(config.level, Level::INFO);
        assert!(config.show_thread_names);
    }

    #[test]
    #[serial(env)]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("TASKPOOL_LOG_LEVEL", "debug");
            std::env::set_var("TASKPOOL_LOG_FORMAT", "json");
            std::env::set_var("TASKPOOL_LOG_FILE", "/tmp/taskpool-test.log");
        }
        let config = LogConfig::new().with_env_overrides();
        clear_env();

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/taskpool-test.log"))
        );
    }

    #[test]
    #[serial(env)]
    fn test_cli_filter_wins_over_env() {
        clear_env();
        unsafe {
            std::env::set_var("TASKPOOL_LOG", "taskpool=trace");
        }
        let config = LogConfig::new()
            .with_filter("warn".to_string())
            .with_env_overrides();
        let from_env = LogConfig::new().with_env_overrides();
        clear_env();

        assert_eq!(config.filter.as_deref(), Some("warn"));
        assert_eq!(from_env.filter.as_deref(), Some("taskpool=trace"));
    }

    #[test]
    fn test_file_appender_writes_to_path() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.log");
        let mut appender = file_appender(&path, LogRotation::Never);
        appender.write_all(b"worker ready\n").unwrap();
        appender.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "worker ready\n");
    }
}
