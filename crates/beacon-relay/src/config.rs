// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay-only settings. Pipeline settings are read by
//! [`beacon::config::PipelineConfig::from_env`].

use std::env;
use std::time::Duration;

use beacon::constants::ANONYMOUS;
use beacon::errors::ConfigError;
use beacon::identity::Identity;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub log_level: String,
    pub flush_interval: Duration,
    pub user_id: String,
    pub operator_id: String,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("BEACON_LOG_LEVEL")
            .map(|level| level.trim().to_lowercase())
            .filter(|level| !level.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "BEACON_LOG_LEVEL".to_string(),
                value: log_level,
                reason: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }

        let flush_interval_secs = match lookup("BEACON_FLUSH_INTERVAL_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "BEACON_FLUSH_INTERVAL_SECS".to_string(),
                    value: raw.clone(),
                    reason: "expected a positive number of seconds".to_string(),
                })?,
            None => DEFAULT_FLUSH_INTERVAL_SECS,
        };

        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Ok(RelayConfig {
            log_level,
            flush_interval: Duration::from_secs(flush_interval_secs),
            user_id: non_empty("BEACON_USER_ID").unwrap_or_else(|| ANONYMOUS.to_string()),
            operator_id: non_empty("BEACON_OPERATOR_ID").unwrap_or_else(|| ANONYMOUS.to_string()),
        })
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id.clone(), self.operator_id.clone())
    }
}
