//! Scheduler configuration.
//!
//! Loaded from an optional YAML file, then overridden by `RUNFORGE_*`
//! environment variables, then validated. The shard list is config-only;
//! it is turned into an immutable directory at startup and never mutated
//! afterwards.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::checkpoint::BufferConfig;
use crate::pipeline::StageConfig;
use crate::scheduler::SchedulerStageConfig;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The config file could not be parsed.
    #[error("Malformed config file: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker-pool tuning for one pipeline stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageTuning {
    /// Base backoff delay after the first transient failure, in ms.
    pub failure_base_delay_ms: u64,
    /// Backoff ceiling, in ms.
    pub failure_max_delay_ms: u64,
    /// Fresh-item admissions per second.
    pub rate_per_second: usize,
    /// Instantaneous admission burst.
    pub burst: usize,
    /// Concurrent workers.
    pub workers: usize,
}

impl Default for StageTuning {
    fn default() -> Self {
        Self {
            failure_base_delay_ms: 100,
            failure_max_delay_ms: 30_000,
            rate_per_second: 10,
            burst: 10,
            workers: 2,
        }
    }
}

impl StageTuning {
    /// Converts to the runtime stage configuration.
    pub fn to_stage_config(&self) -> StageConfig {
        StageConfig {
            failure_base_delay: Duration::from_millis(self.failure_base_delay_ms),
            failure_max_delay: Duration::from_millis(self.failure_max_delay_ms),
            rate_per_second: self.rate_per_second,
            burst: self.burst,
            workers: self.workers,
        }
    }
}

/// One configured shard endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Cluster name workgroups route to.
    pub name: String,
    /// Namespace jobs are created in.
    pub namespace: String,
    /// Submission endpoint base URL.
    pub endpoint: String,
}

/// Full scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identity of this scheduler instance, stamped on every accepted
    /// request. Defaults to the hostname-style instance name.
    pub host_id: String,
    /// PostgreSQL connection URL for the checkpoint store.
    pub database_url: String,
    /// Directory holding algorithm and workgroup resource documents.
    pub resource_dir: PathBuf,
    /// Root directory for externalized payloads.
    pub payload_root: PathBuf,
    /// Hard cap on accepted payload size, in bytes.
    pub max_payload_size_bytes: usize,
    /// Payloads above this size are externalized, in bytes.
    pub inline_payload_threshold_bytes: usize,
    /// Interval between resource cache reloads, in seconds.
    pub resource_refresh_seconds: u64,
    /// Submit stage tuning.
    pub submit: StageTuning,
    /// Late-resubmit stage tuning.
    pub late_submit: StageTuning,
    /// Commit stage tuning.
    pub commit: StageTuning,
    /// Shards jobs can be routed to.
    pub shards: Vec<ShardConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            host_id: "runforge-0".to_string(),
            database_url: String::new(),
            resource_dir: PathBuf::from("./resources"),
            payload_root: PathBuf::from("./payloads"),
            max_payload_size_bytes: 8 * 1024 * 1024,
            inline_payload_threshold_bytes: 32 * 1024,
            resource_refresh_seconds: 30,
            submit: StageTuning::default(),
            late_submit: StageTuning::default(),
            commit: StageTuning::default(),
            shards: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Reads a YAML config file and applies environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: SchedulerConfig = serde_yaml::from_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from environment variables alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RUNFORGE_*` and `DATABASE_URL` overrides in place.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("RUNFORGE_HOST_ID") {
            self.host_id = val;
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = val;
        }
        if let Ok(val) = std::env::var("RUNFORGE_RESOURCE_DIR") {
            self.resource_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RUNFORGE_PAYLOAD_ROOT") {
            self.payload_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RUNFORGE_MAX_PAYLOAD_BYTES") {
            self.max_payload_size_bytes = parse_env_value(&val, "RUNFORGE_MAX_PAYLOAD_BYTES")?;
        }
        if let Ok(val) = std::env::var("RUNFORGE_INLINE_PAYLOAD_BYTES") {
            self.inline_payload_threshold_bytes =
                parse_env_value(&val, "RUNFORGE_INLINE_PAYLOAD_BYTES")?;
        }
        if let Ok(val) = std::env::var("RUNFORGE_RESOURCE_REFRESH_SECONDS") {
            self.resource_refresh_seconds =
                parse_env_value(&val, "RUNFORGE_RESOURCE_REFRESH_SECONDS")?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_id.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "host_id cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
        }

        if self.max_payload_size_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_payload_size_bytes must be greater than 0".to_string(),
            ));
        }

        if self.inline_payload_threshold_bytes > self.max_payload_size_bytes {
            return Err(ConfigError::ValidationFailed(
                "inline_payload_threshold_bytes cannot exceed max_payload_size_bytes".to_string(),
            ));
        }

        if self.resource_refresh_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "resource_refresh_seconds must be greater than 0".to_string(),
            ));
        }

        for tuning in [&self.submit, &self.late_submit, &self.commit] {
            if tuning.workers == 0 {
                return Err(ConfigError::ValidationFailed(
                    "stage workers must be greater than 0".to_string(),
                ));
            }
            if tuning.failure_base_delay_ms == 0 {
                return Err(ConfigError::ValidationFailed(
                    "failure_base_delay_ms must be greater than 0".to_string(),
                ));
            }
            if tuning.failure_max_delay_ms < tuning.failure_base_delay_ms {
                return Err(ConfigError::ValidationFailed(
                    "failure_max_delay_ms cannot be below failure_base_delay_ms".to_string(),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for shard in &self.shards {
            if shard.name.is_empty() || shard.endpoint.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "shard entries need a name and an endpoint".to_string(),
                ));
            }
            if !seen.insert(shard.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate shard name '{}'",
                    shard.name
                )));
            }
        }

        Ok(())
    }

    /// Buffer sizing derived from this config.
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_payload_size_bytes: self.max_payload_size_bytes,
            inline_payload_threshold_bytes: self.inline_payload_threshold_bytes,
        }
    }

    /// Per-stage pipeline tuning derived from this config.
    pub fn stage_config(&self) -> SchedulerStageConfig {
        SchedulerStageConfig {
            submit: self.submit.to_stage_config(),
            late_submit: self.late_submit.to_stage_config(),
            commit: self.commit.to_stage_config(),
        }
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the instance identity.
    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    /// Builder method to append a shard.
    pub fn with_shard(
        mut self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.shards.push(ShardConfig {
            name: name.into(),
            namespace: namespace.into(),
            endpoint: endpoint.into(),
        });
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
