// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry entries and the closed set of categories they are filed under.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ConfigError;

/// Independent telemetry stream. Each category has its own queue, threshold and
/// default delivery method.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    #[serde(alias = "ajax")]
    #[display("network-call")]
    NetworkCall,
    #[display("user-action")]
    UserAction,
    #[serde(alias = "business")]
    #[display("business-event")]
    BusinessEvent,
    #[default]
    #[display("custom")]
    Custom,
    #[display("debug")]
    Debug,
    #[display("performance")]
    Performance,
    #[display("trace")]
    Trace,
}

impl Category {
    /// Every category, in the order a full dump visits them.
    pub const ALL: [Category; 7] = [
        Category::NetworkCall,
        Category::UserAction,
        Category::BusinessEvent,
        Category::Custom,
        Category::Debug,
        Category::Performance,
        Category::Trace,
    ];

    /// Upper-case form used in environment variable names, e.g. `NETWORK_CALL`.
    #[must_use]
    pub fn env_key(self) -> String {
        self.to_string().replace('-', "_").to_uppercase()
    }
}

impl FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "network-call" | "ajax" => Ok(Category::NetworkCall),
            "user-action" => Ok(Category::UserAction),
            "business-event" | "business" => Ok(Category::BusinessEvent),
            "custom" => Ok(Category::Custom),
            "debug" => Ok(Category::Debug),
            "performance" => Ok(Category::Performance),
            "trace" => Ok(Category::Trace),
            _ => Err(ConfigError::InvalidValue {
                key: "category".to_string(),
                value: s.to_string(),
                reason: "unknown category".to_string(),
            }),
        }
    }
}

/// What a producer reported, captured at the call site before it reaches the
/// queue manager.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: i64,
    pub category: Category,
    pub target: Option<String>,
    pub path: String,
    pub payload: Value,
}

impl LogRecord {
    /// Target given at the call site, falling back to a string `target` field in
    /// the payload, then to the empty string.
    #[must_use]
    pub fn resolved_target(&self) -> String {
        if let Some(target) = &self.target {
            return target.clone();
        }
        self.payload
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default()
    }
}

/// One queued telemetry record.
///
/// `last_target` links each entry to the target of the previous entry in the
/// same category, forming a per-category history. The first entry of a session
/// points at [`crate::constants::SESSION_START_TARGET`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub timestamp: i64,
    pub category: Category,
    pub target: String,
    pub last_target: String,
    pub path: String,
    pub payload: Value,
}

impl Entry {
    #[must_use]
    pub fn from_record(record: LogRecord, last_target: String) -> Self {
        let target = record.resolved_target();
        Entry {
            timestamp: record.timestamp,
            category: record.category,
            target,
            last_target,
            path: record.path,
            payload: record.payload,
        }
    }
}
