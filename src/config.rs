//! Configuration management for the rollup engine
//!
//! TOML configuration with environment variable overrides and defaults for
//! every field, so an empty file is a valid configuration.
//!
//! ```toml
//! [engine]
//! unique_precision = 14
//! max_frames = 1000
//!
//! [collector]
//! flush_interval_ms = 60000
//!
//! [storage]
//! backend = "local_disk"
//! data_dir = "/var/lib/rollup"
//!
//! [monitoring]
//! log_level = "info"
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::hll::{MAX_PRECISION, MIN_PRECISION};
use crate::error::{Error, ValidationError};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Aggregation and query limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Background flush
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Finalized bucket storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Aggregation and query limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// HyperLogLog precision for UNIQUE_X rules (registers = 2^precision)
    #[serde(default = "default_unique_precision")]
    pub unique_precision: u8,

    /// Largest frame count a query may ask for
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,

    /// Frame count used when a request does not give one
    #[serde(default = "default_frame")]
    pub default_frame: usize,
}

/// Background flush configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    /// Run the background collector
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between flush passes in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush still-open buckets when the service stops
    #[serde(default = "default_true")]
    pub flush_open_buckets_on_shutdown: bool,
}

/// Where finalized buckets live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory; lost on exit
    Memory,
    /// One file per finalized bucket under `data_dir`
    LocalDisk,
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "local_disk" | "disk" => Ok(StorageBackend::LocalDisk),
            other => Err(Error::Configuration(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Bucket store backend
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Data directory for the local disk backend
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Record Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

// Default value functions
fn default_unique_precision() -> u8 { 14 }
fn default_max_frames() -> usize { 1000 }
fn default_frame() -> usize { 10 }
fn default_flush_interval_ms() -> u64 { 60_000 }
fn default_backend() -> StorageBackend { StorageBackend::Memory }
fn default_data_dir() -> PathBuf { PathBuf::from("/data/kuba-rollup") }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unique_precision: default_unique_precision(),
            max_frames: default_max_frames(),
            default_frame: default_frame(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: default_flush_interval_ms(),
            flush_open_buckets_on_shutdown: true,
        }
    }
}

impl CollectorConfig {
    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

impl MonitoringConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` takes precedence over `log_level`. Returns false when a
    /// subscriber was already installed.
    pub fn init_tracing(&self) -> bool {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.log_level));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);

        if self.structured_logging {
            builder.json().try_init().is_ok()
        } else {
            builder.try_init().is_ok()
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        contents.parse()
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, Error> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `ROLLUP_*` environment variable overrides
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        fn parsed<T: FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(variable = name, value = %raw, "Ignoring unparseable override");
                    None
                },
            }
        }

        // Engine
        if let Some(p) = parsed("ROLLUP_UNIQUE_PRECISION") {
            self.engine.unique_precision = p;
        }
        if let Some(f) = parsed("ROLLUP_MAX_FRAMES") {
            self.engine.max_frames = f;
        }

        // Collector
        if let Some(ms) = parsed("ROLLUP_FLUSH_INTERVAL_MS") {
            self.collector.flush_interval_ms = ms;
        }
        if let Some(enabled) = parsed("ROLLUP_COLLECTOR_ENABLED") {
            self.collector.enabled = enabled;
        }

        // Storage
        if let Some(backend) = parsed("ROLLUP_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(data_dir) = std::env::var("ROLLUP_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        // Monitoring
        if let Some(enabled) = parsed("ROLLUP_METRICS_ENABLED") {
            self.monitoring.metrics_enabled = enabled;
        }
        if let Ok(log_level) = std::env::var("ROLLUP_LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let out_of_range = |field: &str, value: String, min: String, max: String| {
            ValidationError::OutOfRange {
                field: field.to_string(),
                value,
                min,
                max,
            }
        };

        let precision = self.engine.unique_precision;
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(out_of_range(
                "engine.unique_precision",
                precision.to_string(),
                MIN_PRECISION.to_string(),
                MAX_PRECISION.to_string(),
            ));
        }

        if self.engine.max_frames == 0 {
            return Err(out_of_range(
                "engine.max_frames",
                "0".to_string(),
                "1".to_string(),
                usize::MAX.to_string(),
            ));
        }
        if self.engine.default_frame == 0 || self.engine.default_frame > self.engine.max_frames {
            return Err(out_of_range(
                "engine.default_frame",
                self.engine.default_frame.to_string(),
                "1".to_string(),
                self.engine.max_frames.to_string(),
            ));
        }

        if self.collector.flush_interval_ms == 0 {
            return Err(out_of_range(
                "collector.flush_interval_ms",
                "0".to_string(),
                "1".to_string(),
                u64::MAX.to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::LocalDisk
            && self.storage.data_dir.as_os_str().is_empty()
        {
            return Err(ValidationError::InvalidName {
                kind: "data directory",
                name: String::new(),
                reason: "the local disk backend needs a data directory".to_string(),
            });
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), Error> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| Error::Configuration(format!("Failed to write config file {}: {}", path, e)))
    }
}
