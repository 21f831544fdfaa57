use crate::config::{EngineConfig, LogLevel};
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system
pub struct LogConfig {
    /// Directory where log files will be stored
    pub log_dir: PathBuf,
    /// Prefix for log file names
    pub file_prefix: String,
    /// Maximum number of log files to keep (rotation)
    pub max_files: usize,
    /// Whether the JSON file layer is installed at all
    pub to_file: bool,
    /// Level used when RUST_LOG is absent
    pub default_level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl LogConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            log_dir: config.log_dir(),
            file_prefix: "drivebase-engine".to_string(),
            max_files: config.log.max_files,
            to_file: config.log.to_file,
            default_level: config.log.level,
        }
    }
}

/// Initialize the logging system with file and stdout output
///
/// # Log Targets
/// - `uploader` / `uploader::session` - Chunked upload sessions and the upload worker
/// - `transfer` - Provider-to-provider moves
/// - `sync` - Provider tree reconciliation
/// - `tasks::queue` / `tasks::worker` - Durable job queue and worker pools
/// - `activity` - Job state transitions
/// - `providers::local` / `providers::webdav` - Backend calls
/// - `inventory` - Database setup
/// - `api` - HTTP surface
/// - `main` - Process lifecycle
///
/// # Example
/// ```bash
/// RUST_LOG=transfer=debug,tasks=info drivebase-engine
/// ```
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    if !config.to_file {
        tracing_subscriber::registry()
            .with(stdout_layer(config.default_level))
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(LogGuard {
            _worker_guard: None,
        });
    }

    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.log_dir)
        .context("Failed to create file appender")?;

    // The guard MUST be kept alive for the entire application lifetime
    let (non_blocking_file, worker_guard) = tracing_appender::non_blocking(file_appender);

    // Create file layer (JSON format for structured logging)
    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(build_filter(config.default_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer(config.default_level))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        target: "main",
        log_dir = %config.log_dir.display(),
        max_files = config.max_files,
        "Logging system initialized"
    );

    Ok(LogGuard {
        _worker_guard: Some(worker_guard),
    })
}

/// Human-readable stdout layer with colors
fn stdout_layer<S>(default_level: LogLevel) -> impl Layer<S> + Send + Sync + 'static
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .compact()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(true)
        .with_filter(build_filter(default_level))
}

/// RUST_LOG wins; otherwise fall back to the configured level
fn build_filter(default_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

/// Guard that ensures logs are flushed before exit
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!(target: "main", "Flushing logs before shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_follows_engine_config() {
        let mut engine = EngineConfig::default();
        engine.data_dir = PathBuf::from("/tmp/drivebase-test");
        engine.log.max_files = 9;
        let config = LogConfig::from_engine(&engine);
        assert_eq!(config.file_prefix, "drivebase-engine");
        assert_eq!(config.max_files, 9);
        assert_eq!(config.log_dir, PathBuf::from("/tmp/drivebase-test/logs"));
    }

    #[test]
    fn test_log_directory_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let config = LogConfig {
            log_dir: log_dir.clone(),
            file_prefix: "test".to_string(),
            max_files: 3,
            to_file: true,
            default_level: LogLevel::Debug,
        };

        // Another test may already have installed a global subscriber
        let _guard = init_logging(config);
        assert!(log_dir.exists());
    }
}
