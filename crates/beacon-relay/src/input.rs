// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records read from stdin, one JSON object per line:
//!
//! ```text
//! {"category": "user-action", "target": "buy-button", "payload": {"sku": "A-1"}}
//! ```
//!
//! `category` defaults to `custom` and `target` to the payload's own `target`.

use beacon::entry::Category;
use beacon::errors::PipelineError;
use beacon::service::PipelineHandle;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InputRecord {
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl InputRecord {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, serde_json::Error> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }

    pub fn submit(self, handle: &PipelineHandle) -> Result<(), PipelineError> {
        match self.category {
            Category::BusinessEvent => handle
                .log_business(self.payload, self.target.as_deref())
                .map(|_| ()),
            category => handle.log_with_category(self.payload, category, self.target.as_deref()),
        }
    }
}
