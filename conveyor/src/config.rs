//! Run configuration.
//!
//! The config file is a JSON mapping with a reserved top-level key per
//! extension category (`fetchers`, `sources`, `emitters`, `reporters`),
//! the `pipes` tuning block, and the `log` block. Each category maps
//! extension-type names to instance ids to option blocks:
//!
//! ```json
//! {
//!   "fetchers": {
//!     "file-fetcher": {
//!       "archive": { "basePath": "/srv/docs", "spoolToTemp": true }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use serde_json as json;
use thiserror::Error;

/// Extension instances of one category: type name to instance id to
/// option block.
pub type Extensions = BTreeMap<String, BTreeMap<String, json::Value>>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration JSON error: {0}")]
    Json(#[from] json::Error),
    #[error("configuration error: {0}")]
    Custom(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub fetchers: Extensions,
    #[serde(default)]
    pub sources: Extensions,
    #[serde(default)]
    pub emitters: Extensions,
    #[serde(default)]
    pub reporters: Extensions,
    #[serde(default)]
    pub pipes: PipesConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load a configuration from the given path. Environment overrides
    /// are applied on top of the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg: Self = json::from_reader(fs::File::open(path)?)?;
        cfg.pipes.apply_env()?;

        Ok(cfg)
    }

    /// Write configuration to disk.
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;

        json::to_writer_pretty(&file, self)?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> Result<log::Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::Custom(format!("invalid log level `{}`", self.level)))
    }
}

/// The pipes tuning block. Every knob has a default.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipesConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Number of forked parse children, when `forked` is set.
    pub max_forked_children: usize,
    /// Parse in child processes rather than in-process.
    pub forked: bool,
    pub parse_timeout_millis: u64,
    /// How long a worker waits for a free parse slot.
    pub client_timeout_millis: u64,
    pub ping_interval_millis: u64,
    pub ping_timeout_millis: u64,
    /// How long in-flight tuples get to finish after a shutdown signal.
    pub shutdown_grace_millis: u64,
    /// Work queue bound. Defaults to `numWorkers * 2`.
    pub work_queue_capacity: Option<usize>,
    pub emit_batch_size: usize,
    pub emit_batch_timeout_millis: u64,
    pub max_embedded_depth: usize,
    /// Resident memory above which a child finishes its request and asks
    /// to be restarted.
    pub memory_high_water_mark: u64,
    /// Parse bodies above this size go to a child by file path rather
    /// than inline.
    pub inline_threshold_bytes: u64,
    /// Base directory for run-scoped temp files. Defaults to the system
    /// temp directory.
    pub temp_dir: Option<PathBuf>,
    pub temp_retention_millis: u64,
    pub fetch_retries: u32,
    pub emit_retries: u32,
    /// Path of the child worker binary. Defaults to `conveyor-worker`
    /// next to the running executable.
    pub worker_command: Option<PathBuf>,
}

impl Default for PipesConfig {
    fn default() -> Self {
        Self {
            num_workers: 8,
            max_forked_children: 4,
            forked: false,
            parse_timeout_millis: 60_000,
            client_timeout_millis: 60_000,
            ping_interval_millis: 1_000,
            ping_timeout_millis: 30_000,
            shutdown_grace_millis: 30_000,
            work_queue_capacity: None,
            emit_batch_size: 100,
            emit_batch_timeout_millis: 1_000,
            max_embedded_depth: crate::parser::DEFAULT_MAX_EMBEDDED_DEPTH,
            memory_high_water_mark: 1024 * 1024 * 1024,
            inline_threshold_bytes: 512 * 1024,
            temp_dir: None,
            temp_retention_millis: 24 * 60 * 60 * 1000,
            fetch_retries: 2,
            emit_retries: 2,
            worker_command: None,
        }
    }
}

impl PipesConfig {
    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(workers) = env::var("PIPES_NUM_WORKERS") {
            self.num_workers = workers.parse().map_err(|_| {
                ConfigError::Custom(format!("invalid PIPES_NUM_WORKERS `{workers}`"))
            })?;
        }
        if let Ok(timeout) = env::var("PIPES_PARSE_TIMEOUT_MS") {
            self.parse_timeout_millis = timeout.parse().map_err(|_| {
                ConfigError::Custom(format!("invalid PIPES_PARSE_TIMEOUT_MS `{timeout}`"))
            })?;
        }
        Ok(())
    }

    pub fn work_queue_capacity(&self) -> usize {
        self.work_queue_capacity
            .unwrap_or(self.num_workers * 2)
            .max(1)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_millis(self.parse_timeout_millis)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_millis)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_millis)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }

    pub fn emit_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_batch_timeout_millis)
    }

    pub fn temp_retention(&self) -> Duration {
        Duration::from_millis(self.temp_retention_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(cfg.pipes.num_workers, 8);
        assert_eq!(cfg.pipes.work_queue_capacity(), 16);
        assert!(!cfg.pipes.forked);
        assert_eq!(cfg.log.level().unwrap(), log::Level::Info);
    }

    #[test]
    fn test_category_shape() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "fetchers": {
                    "file-fetcher": {
                        "archive": { "basePath": "/srv/docs", "spoolToTemp": true },
                        "photos": { "basePath": "/srv/photos" }
                    }
                },
                "pipes": { "numWorkers": 2, "workQueueCapacity": 7 }
            }"#,
        )
        .unwrap();

        let instances = &cfg.fetchers["file-fetcher"];
        assert_eq!(instances.len(), 2);
        assert!(instances.contains_key("archive"));
        assert_eq!(cfg.pipes.num_workers, 2);
        assert_eq!(cfg.pipes.work_queue_capacity(), 7);
    }

    #[test]
    fn test_invalid_log_level() {
        let cfg: Config = serde_json::from_str(r#"{ "log": { "level": "loud" } }"#).unwrap();
        assert!(cfg.log.level().is_err());
    }
}
