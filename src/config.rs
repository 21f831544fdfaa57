use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Fallback level when RUST_LOG is not set
    pub level: LogLevel,
    /// Whether to write JSON logs to a rolling file
    pub to_file: bool,
    /// Maximum number of log files to keep
    pub max_files: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            to_file: true,
            max_files: 5,
        }
    }
}

/// Chunked upload section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Default chunk size in bytes when the client does not pick one
    pub chunk_size: u64,
    /// Session lifetime in seconds
    pub session_ttl_secs: u64,
    /// Provider progress publish interval in bytes
    pub progress_interval_bytes: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: 50 * 1024 * 1024,
            session_ttl_secs: 24 * 60 * 60,
            progress_interval_bytes: 1024 * 1024,
        }
    }
}

/// Provider-to-provider transfer section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Manifest checkpoint interval and multipart part size in bytes
    pub checkpoint_size: u64,
    /// Lifetime of a cancellation flag in seconds
    pub cancel_ttl_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            checkpoint_size: 8 * 1024 * 1024,
            cancel_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Per-queue worker tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueTuning {
    pub concurrency: usize,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub uploads: QueueTuning,
    pub transfers: QueueTuning,
    pub sync: QueueTuning,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How often idle workers look for due jobs
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            uploads: QueueTuning {
                concurrency: 3,
                max_attempts: 3,
            },
            transfers: QueueTuning {
                concurrency: 2,
                max_attempts: 5,
            },
            sync: QueueTuning {
                concurrency: 2,
                max_attempts: 3,
            },
            backoff_base_ms: 5_000,
            backoff_max_ms: 5 * 60 * 1000,
            poll_interval_ms: 1_000,
        }
    }
}

impl QueueSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Engine configuration stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the SQLite database and logs
    pub data_dir: PathBuf,
    /// Scratch space for received chunks and assembled uploads
    pub upload_temp_dir: PathBuf,
    /// Scratch space for transfer manifests and cached payloads
    pub transfer_cache_dir: PathBuf,
    /// Address the HTTP surface binds to
    pub listen_addr: String,
    /// Secret used to derive the provider config encryption key
    pub config_secret: String,
    pub upload: UploadSettings,
    pub transfer: TransferSettings,
    pub queues: QueueSettings,
    pub log: LogSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = Self::default_base_dir();
        Self {
            data_dir: base.clone(),
            upload_temp_dir: base.join("uploads"),
            transfer_cache_dir: base.join("transfers"),
            listen_addr: "127.0.0.1:4000".to_string(),
            config_secret: "change-me".to_string(),
            upload: UploadSettings::default(),
            transfer: TransferSettings::default(),
            queues: QueueSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Base directory for everything the engine stores (~/.drivebase)
    fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".drivebase")
    }

    /// Default config file path (~/.drivebase/config.json)
    pub fn default_path() -> PathBuf {
        Self::default_base_dir().join("config.json")
    }

    /// Load configuration from the specified path, using defaults for missing fields
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;

        // serde's #[serde(default)] handles missing fields automatically
        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config file")?;

        tracing::info!(target: "config", path = %path.display(), "Loaded configuration from file");

        Ok(config)
    }

    /// Persist the configuration as pretty JSON
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        tracing::debug!(target: "config", path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("drivebase.db")
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.upload.session_ttl_secs)
    }

    pub fn cancel_ttl(&self) -> Duration {
        Duration::from_secs(self.transfer.cancel_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.upload.chunk_size, 52_428_800);
        assert_eq!(config.transfer.checkpoint_size, 8 * 1024 * 1024);
        assert_eq!(config.queues.uploads.concurrency, 3);
        assert_eq!(config.queues.transfers.concurrency, 2);
        assert_eq!(config.queues.sync.concurrency, 2);
        assert_eq!(config.session_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_load_with_missing_fields() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"{{"upload": {{"chunk_size": 1048576}}}}"#).unwrap();

        let config = EngineConfig::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.upload.chunk_size, 1_048_576);
        // Untouched fields keep their defaults
        assert_eq!(config.upload.session_ttl_secs, 86_400);
        assert_eq!(config.queues.transfers.max_attempts, 5);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = EngineConfig::load_from_path(Path::new("/nonexistent/path/config.json")).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4000");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = EngineConfig::default();
        config.log.level = LogLevel::Debug;
        config.save_to_path(&path).unwrap();

        let loaded = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.log.level, LogLevel::Debug);
    }
}
