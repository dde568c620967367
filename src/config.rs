//! Configuration management for Ringrate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, RingrateError};
use crate::ratelimit::Estimator;

/// Settings for one sliding window (one action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Optional key prefix shared by several actions
    #[serde(default)]
    pub namespace: Option<String>,

    /// Name of the limited operation, part of every window key
    pub action: String,

    /// Seconds covered by one lap of the bucket ring
    #[serde(default = "default_bucket_span")]
    pub bucket_span: u64,

    /// Seconds per bucket
    #[serde(default = "default_bucket_interval")]
    pub bucket_interval: u64,

    /// Seconds of recent history used for rate estimation
    #[serde(default = "default_rate_interval")]
    pub rate_interval: u64,

    /// Estimate returned by `current_rate`
    #[serde(default)]
    pub estimator: Estimator,
}

fn default_bucket_span() -> u64 {
    600
}

fn default_bucket_interval() -> u64 {
    5
}

fn default_rate_interval() -> u64 {
    60
}

/// Ring geometry derived from a validated [`WindowConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    /// Buckets on the ring
    pub bucket_count: usize,
    /// Most recent buckets summed for a rate
    pub buckets_used_for_rate: usize,
    /// Buckets cleared ahead of the current one on every write and read
    pub buckets_to_evict: usize,
    /// Time-to-live of a window key, renewed on every write
    pub expiry_secs: u64,
}

impl WindowConfig {
    /// Create a configuration for `action` with the default geometry.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            namespace: None,
            action: action.into(),
            bucket_span: default_bucket_span(),
            bucket_interval: default_bucket_interval(),
            rate_interval: default_rate_interval(),
            estimator: Estimator::default(),
        }
    }

    /// Load a window configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading window configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a window configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RingrateError::Config(format!("Failed to parse window config: {}", e)))
    }

    /// Check the ring geometry and derive its layout.
    ///
    /// The bucket interval must evenly divide both the span and the rate
    /// interval, and the rate interval must fit on the ring.
    pub fn validate(&self) -> Result<WindowLayout> {
        if self.action.is_empty() {
            return Err(RingrateError::Config("action must not be empty".to_string()));
        }
        if self.bucket_interval == 0 {
            return Err(RingrateError::Config(
                "bucket_interval must be greater than zero".to_string(),
            ));
        }
        if self.bucket_span < 2 {
            return Err(RingrateError::Config(format!(
                "bucket_span must be at least 2 seconds, got {}",
                self.bucket_span
            )));
        }
        if self.rate_interval == 0 {
            return Err(RingrateError::Config(
                "rate_interval must be greater than zero".to_string(),
            ));
        }
        if self.bucket_span % self.bucket_interval != 0 {
            return Err(RingrateError::Config(format!(
                "bucket_interval {} does not evenly divide bucket_span {}",
                self.bucket_interval, self.bucket_span
            )));
        }
        if self.rate_interval % self.bucket_interval != 0 {
            return Err(RingrateError::Config(format!(
                "bucket_interval {} does not evenly divide rate_interval {}",
                self.bucket_interval, self.rate_interval
            )));
        }

        let bucket_count = (self.bucket_span / self.bucket_interval) as usize;
        let buckets_used_for_rate = (self.rate_interval / self.bucket_interval) as usize;
        if buckets_used_for_rate > bucket_count {
            return Err(RingrateError::Config(format!(
                "rate_interval {} is longer than bucket_span {}",
                self.rate_interval, self.bucket_span
            )));
        }

        Ok(WindowLayout {
            bucket_count,
            buckets_used_for_rate,
            buckets_to_evict: bucket_count - buckets_used_for_rate,
            expiry_secs: self.bucket_span - 1,
        })
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

/// Configuration for the `ringrate` command-line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Window configuration
    pub window: WindowConfig,
}

impl AppConfig {
    /// Load configuration from an optional file, then from `RINGRATE__`
    /// environment variables (e.g. `RINGRATE__WINDOW__ACTION=login`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("RINGRATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RingrateError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| RingrateError::Config(e.to_string()))
    }
}
