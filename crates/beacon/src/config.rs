// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.
//!
//! Configuration can be built in code (every struct implements `Default` and
//! `Deserialize`) or read from `BEACON_*` environment variables with
//! [`PipelineConfig::from_env`]. Either way it should pass
//! [`PipelineConfig::validate`] before a pipeline is started.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_POOL_MAX_SIZE, DEFAULT_POOL_RETRY_WAIT_MS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RESET_TIMEOUT_MS, DEFAULT_STORAGE_NAMESPACE, DEFAULT_THRESHOLD,
    HIGH_VOLUME_THRESHOLD,
};
use crate::entry::Category;
use crate::errors::ConfigError;
use crate::util::parse_storage_namespace;

/// How a flushed batch leaves the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum DumpMethod {
    /// Persist to the recovery store for a later session to pick up.
    #[serde(alias = "local")]
    #[display("durable")]
    Durable,
    /// Emit through the inspect sink.
    #[serde(alias = "console")]
    #[display("inspect")]
    Inspect,
    /// Post to the collection endpoint through a pooled channel.
    #[serde(alias = "loghost")]
    #[display("transmit")]
    Transmit,
}

impl FromStr for DumpMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "durable" | "local" => Ok(DumpMethod::Durable),
            "inspect" | "console" => Ok(DumpMethod::Inspect),
            "transmit" | "loghost" => Ok(DumpMethod::Transmit),
            _ => Err(ConfigError::InvalidValue {
                key: "method".to_string(),
                value: s.to_string(),
                reason: "expected one of durable, inspect, transmit".to_string(),
            }),
        }
    }
}

/// Per-category overrides. Unset fields fall back to the global values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryConfig {
    pub threshold: Option<usize>,
    pub default_method: Option<DumpMethod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Wait between acquisition attempts while the pool is saturated.
    pub retry_wait_ms: u64,
    /// `None` keeps polling until a channel frees up.
    pub acquire_max_attempts: Option<u32>,
    /// `None` waits for a channel reset indefinitely, outside the pool's
    /// capacity.
    pub reset_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            retry_wait_ms: DEFAULT_POOL_RETRY_WAIT_MS,
            acquire_max_attempts: None,
            reset_timeout_ms: Some(DEFAULT_RESET_TIMEOUT_MS),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    #[must_use]
    pub fn reset_timeout(&self) -> Option<Duration> {
        self.reset_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Queue length that triggers a flush for categories without their own threshold.
    pub threshold: usize,
    pub default_method: DumpMethod,
    pub categories: BTreeMap<Category, CategoryConfig>,
    pub pool: PoolConfig,
    /// Collection endpoint for the transmit method. Without one, transmit
    /// flushes fall back to the durable method.
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
    /// zstd level applied to transmitted bodies; `None` sends plain JSON.
    pub compression_level: Option<i32>,
    /// Directory of the file-backed recovery store; `None` keeps recovery
    /// state in memory.
    pub storage_dir: Option<PathBuf>,
    pub storage_namespace: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let high_volume = CategoryConfig {
            threshold: Some(HIGH_VOLUME_THRESHOLD),
            default_method: None,
        };
        let categories = [
            Category::NetworkCall,
            Category::Debug,
            Category::Performance,
            Category::Trace,
        ]
        .into_iter()
        .map(|category| (category, high_volume))
        .collect();

        Self {
            threshold: DEFAULT_THRESHOLD,
            default_method: DumpMethod::Transmit,
            categories,
            pool: PoolConfig::default(),
            endpoint: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            compression_level: None,
            storage_dir: None,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from `BEACON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup, using the same keys as
    /// [`PipelineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(threshold) = parse_var(&lookup, "BEACON_THRESHOLD")? {
            config.threshold = threshold;
        }
        if let Some(method) = parse_var(&lookup, "BEACON_DEFAULT_METHOD")? {
            config.default_method = method;
        }

        for category in Category::ALL {
            let prefix = format!("BEACON_{}", category.env_key());
            let threshold = parse_var(&lookup, &format!("{prefix}_THRESHOLD"))?;
            let method = parse_var(&lookup, &format!("{prefix}_METHOD"))?;
            if threshold.is_none() && method.is_none() {
                continue;
            }
            let overrides = config.categories.entry(category).or_default();
            if threshold.is_some() {
                overrides.threshold = threshold;
            }
            if method.is_some() {
                overrides.default_method = method;
            }
        }

        if let Some(max_size) = parse_var(&lookup, "BEACON_POOL_MAX_SIZE")? {
            config.pool.max_size = max_size;
        }
        if let Some(retry_wait_ms) = parse_var(&lookup, "BEACON_POOL_RETRY_WAIT_MS")? {
            config.pool.retry_wait_ms = retry_wait_ms;
        }
        config.pool.acquire_max_attempts =
            parse_var(&lookup, "BEACON_POOL_ACQUIRE_MAX_ATTEMPTS")?;
        if let Some(reset_timeout_ms) = parse_var::<u64, _>(&lookup, "BEACON_RESET_TIMEOUT_MS")? {
            // 0 leaves resets unbounded; a resetting channel then gives up its slot
            config.pool.reset_timeout_ms = (reset_timeout_ms > 0).then_some(reset_timeout_ms);
        }

        config.endpoint = lookup("BEACON_ENDPOINT").filter(|url| !url.trim().is_empty());
        if let Some(timeout) = parse_var(&lookup, "BEACON_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = timeout;
        }
        config.compression_level = parse_var(&lookup, "BEACON_COMPRESSION_LEVEL")?;

        config.storage_dir = lookup("BEACON_STORAGE_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);
        if let Some(namespace) = lookup("BEACON_STORAGE_NAMESPACE") {
            config.storage_namespace =
                parse_storage_namespace(&namespace).ok_or_else(|| ConfigError::InvalidValue {
                    key: "BEACON_STORAGE_NAMESPACE".to_string(),
                    value: namespace.clone(),
                    reason: "expected a letter followed by letters, digits, '-', '_' or '.'"
                        .to_string(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::Invalid(
                "threshold must be greater than 0".to_string(),
            ));
        }
        for (category, overrides) in &self.categories {
            if overrides.threshold == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "threshold for category '{category}' must be greater than 0"
                )));
            }
        }

        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid(
                "pool max size must be greater than 0".to_string(),
            ));
        }
        if self.pool.acquire_max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "pool acquire attempts must be greater than 0 when set".to_string(),
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidValue {
                key: "endpoint".to_string(),
                value: endpoint.clone(),
                reason: e.to_string(),
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::InvalidValue {
                    key: "endpoint".to_string(),
                    value: endpoint.clone(),
                    reason: "only http and https endpoints are supported".to_string(),
                });
            }
        }

        if let Some(level) = self.compression_level {
            if !zstd::compression_level_range().contains(&level) {
                return Err(ConfigError::InvalidValue {
                    key: "compression_level".to_string(),
                    value: level.to_string(),
                    reason: "outside the supported zstd range".to_string(),
                });
            }
        }

        if parse_storage_namespace(&self.storage_namespace).as_deref()
            != Some(self.storage_namespace.as_str())
        {
            return Err(ConfigError::InvalidValue {
                key: "storage_namespace".to_string(),
                value: self.storage_namespace.clone(),
                reason: "expected a letter followed by letters, digits, '-', '_' or '.'"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Queue length at which `category` is flushed.
    #[must_use]
    pub fn threshold_for(&self, category: Category) -> usize {
        self.categories
            .get(&category)
            .and_then(|overrides| overrides.threshold)
            .unwrap_or(self.threshold)
    }

    /// Method used when a dump names none for `category`.
    #[must_use]
    pub fn method_for(&self, category: Category) -> DumpMethod {
        self.categories
            .get(&category)
            .and_then(|overrides| overrides.default_method)
            .unwrap_or(self.default_method)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
