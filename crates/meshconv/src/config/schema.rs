use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::SourceFormat;
use crate::queue::{RetentionPolicy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            storage: StorageConfig::default(),
            jobs: JobsConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            converter: ConverterConfig::default(),
            sweeper: SweeperConfig::default(),
            validation: ValidationConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// File locations. Unset paths are derived from `data_dir`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default)]
    pub outputs_dir: Option<PathBuf>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// `data_dir`, else `<local data dir>/meshconv`, else `./.meshconv`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("meshconv"))
                .unwrap_or_else(|| PathBuf::from(".meshconv"))
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.uploads_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("uploads"))
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.outputs_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("outputs"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("meshconv.db"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl JobsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            retention: RetentionConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_completed_max")]
    pub completed_max: u32,
    #[serde(default = "default_completed_max_age_hours")]
    pub completed_max_age_hours: u64,
    #[serde(default = "default_failed_max")]
    pub failed_max: u32,
    #[serde(default = "default_failed_max_age_hours")]
    pub failed_max_age_hours: u64,
}

fn default_completed_max() -> u32 {
    100
}

fn default_completed_max_age_hours() -> u64 {
    1
}

fn default_failed_max() -> u32 {
    500
}

fn default_failed_max_age_hours() -> u64 {
    24
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_max: default_completed_max(),
            completed_max_age_hours: default_completed_max_age_hours(),
            failed_max: default_failed_max(),
            failed_max_age_hours: default_failed_max_age_hours(),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed_max: self.completed_max,
            completed_max_age: Duration::from_secs(self.completed_max_age_hours * 3600),
            failed_max: self.failed_max,
            failed_max_age: Duration::from_secs(self.failed_max_age_hours * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Simultaneous conversions across all workers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_store_write_attempts")]
    pub store_write_attempts: u32,
    #[serde(default = "default_store_retry_base_ms")]
    pub store_retry_base_ms: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_max_concurrent() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_store_write_attempts() -> u32 {
    3
}

fn default_store_retry_base_ms() -> u64 {
    100
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            store_write_attempts: default_store_write_attempts(),
            store_retry_base_ms: default_store_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Conversion script passed as the first argument, if the program needs one.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_program() -> String {
    "freecadcmd".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Files younger than this are never swept.
    #[serde(default = "default_min_artifact_age_secs")]
    pub min_artifact_age_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_min_artifact_age_secs() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            min_artifact_age_secs: default_min_artifact_age_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_tolerance")]
    pub min_tolerance: f64,
    #[serde(default = "default_max_tolerance")]
    pub max_tolerance: f64,
    #[serde(default = "default_tolerance")]
    pub default_tolerance: f64,
    #[serde(default = "default_allowed_formats")]
    pub allowed_formats: Vec<SourceFormat>,
}

fn default_min_tolerance() -> f64 {
    0.001
}

fn default_max_tolerance() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_allowed_formats() -> Vec<SourceFormat> {
    SourceFormat::ALL.to_vec()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_tolerance: default_min_tolerance(),
            max_tolerance: default_max_tolerance(),
            default_tolerance: default_tolerance(),
            allowed_formats: default_allowed_formats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_active_interval_ms")]
    pub active_interval_ms: u64,
    #[serde(default = "default_backoff_interval_ms")]
    pub backoff_interval_ms: u64,
}

fn default_active_interval_ms() -> u64 {
    1500
}

fn default_backoff_interval_ms() -> u64 {
    3000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: default_active_interval_ms(),
            backoff_interval_ms: default_backoff_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
