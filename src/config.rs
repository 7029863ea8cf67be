//! Spill configuration
//!
//! Configuration for overflow bridges, loadable from TOML with
//! environment variable overrides and sensible defaults.
//!
//! ```toml
//! enabled = true
//! directory = "/var/spool/telemetry"
//! keep_files = false
//! max_records_per_file = 10000
//! output_wait_ms = 100
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest accepted worker poll interval
pub const MINIMUM_OUTPUT_WAIT_MS: u64 = 10;

/// Spill configuration shared by all bridges of a process
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpillConfig {
    /// Spill to disk when the target queue is full
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root directory; each bridge creates its own subdirectory here
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Leave spill files on disk after use (diagnostics)
    #[serde(default)]
    pub keep_files: bool,

    /// Recycle drained spill files
    #[serde(default = "default_true")]
    pub reuse_files: bool,

    /// Records per file before rotating to a new one
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    /// How long the worker waits for a new record before unspilling
    #[serde(default = "default_output_wait_ms")]
    pub output_wait_ms: u64,

    /// How long `put` waits before logging and retrying
    #[serde(default = "default_put_retry_ms")]
    pub put_retry_ms: u64,

    /// How long shutdown waits for the worker
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Bound of the producer-facing queue (unbounded when absent)
    #[serde(default)]
    pub producer_queue_capacity: Option<usize>,

    /// Upper limit applied to consumer-facing queue sizes
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Attempts when creating a uniquely named directory or file
    #[serde(default = "default_name_attempts")]
    pub name_attempts: u32,

    /// Upper bound of the random backoff between name attempts
    #[serde(default = "default_name_backoff_ms")]
    pub name_backoff_ms: u64,

    /// Tag distinguishing the producing application in directory names
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

// Default value functions
fn default_true() -> bool { true }
fn default_directory() -> PathBuf { std::env::temp_dir().join("telemetry-spill") }
fn default_max_records_per_file() -> usize { 10_000 }
fn default_output_wait_ms() -> u64 { 100 }
fn default_put_retry_ms() -> u64 { 5_000 }
fn default_join_timeout_ms() -> u64 { 30_000 }
fn default_max_queue_size() -> usize { usize::MAX }
fn default_name_attempts() -> u32 { 100 }
fn default_name_backoff_ms() -> u64 { 500 }
fn default_source_tag() -> String { "FSW".to_string() }

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_directory(),
            keep_files: false,
            reuse_files: true,
            max_records_per_file: default_max_records_per_file(),
            output_wait_ms: default_output_wait_ms(),
            put_retry_ms: default_put_retry_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            producer_queue_capacity: None,
            max_queue_size: default_max_queue_size(),
            name_attempts: default_name_attempts(),
            name_backoff_ms: default_name_backoff_ms(),
            source_tag: default_source_tag(),
        }
    }
}

impl SpillConfig {
    /// Create a config spilling under `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Enable/disable spilling
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Keep spill files on disk
    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    /// Enable/disable file reuse
    pub fn reuse_files(mut self, reuse: bool) -> Self {
        self.reuse_files = reuse;
        self
    }

    /// Set rotation threshold
    pub fn max_records_per_file(mut self, records: usize) -> Self {
        self.max_records_per_file = records;
        self
    }

    /// Set worker poll interval, clamped to the minimum
    pub fn output_wait(mut self, wait: Duration) -> Self {
        self.output_wait_ms = (wait.as_millis() as u64).max(MINIMUM_OUTPUT_WAIT_MS);
        self
    }

    /// Set put retry interval
    pub fn put_retry(mut self, retry: Duration) -> Self {
        self.put_retry_ms = retry.as_millis() as u64;
        self
    }

    /// Set shutdown join timeout
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Bound the producer-facing queue
    pub fn producer_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.producer_queue_capacity = capacity;
        self
    }

    /// Set name collision retry policy
    pub fn name_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.name_attempts = attempts;
        self.name_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set source tag
    pub fn source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = tag.into();
        self
    }

    /// Worker poll interval, never below the minimum
    pub fn output_wait_duration(&self) -> Duration {
        Duration::from_millis(self.output_wait_ms.max(MINIMUM_OUTPUT_WAIT_MS))
    }

    /// Put retry interval
    pub fn put_retry_duration(&self) -> Duration {
        Duration::from_millis(self.put_retry_ms)
    }

    /// Shutdown join timeout
    pub fn join_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Name collision backoff bound
    pub fn name_backoff_duration(&self) -> Duration {
        Duration::from_millis(self.name_backoff_ms)
    }

    /// Capacity to use for a consumer-facing queue that wants `requested`
    pub fn effective_target_capacity(&self, requested: usize) -> usize {
        requested.min(self.max_queue_size).max(1)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records_per_file == 0 {
            return Err(ConfigError::Invalid("max_records_per_file must be > 0".to_string()));
        }

        if self.put_retry_ms == 0 {
            return Err(ConfigError::Invalid("put_retry_ms must be > 0".to_string()));
        }

        if self.name_attempts == 0 {
            return Err(ConfigError::Invalid("name_attempts must be > 0".to_string()));
        }

        if self.producer_queue_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "producer_queue_capacity must be > 0 when set".to_string(),
            ));
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be > 0".to_string()));
        }

        if self.enabled && self.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "directory cannot be empty when spilling is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("Failed to read config file {}: {}", path, e)))?;

        Self::from_toml_str(&contents)
            .map_err(|e| ConfigError::Load(format!("Failed to parse config file {}: {}", path, e)))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_parse("SPILL_ENABLE") {
            self.enabled = enabled;
        }
        if let Ok(dir) = std::env::var("SPILL_DIR") {
            self.directory = PathBuf::from(dir);
        }
        if let Some(keep) = env_parse("SPILL_KEEP_OUTPUT") {
            self.keep_files = keep;
        }
        if let Some(reuse) = env_parse("SPILL_REUSE_FILES") {
            self.reuse_files = reuse;
        }
        if let Some(wait) = env_parse::<u64>("SPILL_OUTPUT_WAIT_MS") {
            self.output_wait_ms = wait.max(MINIMUM_OUTPUT_WAIT_MS);
        }
        if let Some(records) = env_parse("SPILL_MAX_RECORDS_PER_FILE") {
            self.max_records_per_file = records;
        }
        if let Some(size) = env_parse::<usize>("SPILL_QUEUE_SIZE") {
            self.max_queue_size = size.max(1);
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Load(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::Load(format!("Failed to write config file {}: {}", path, e)))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
