// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::identity::Identity;

/// One outbound batch: the entries of a single category flush together with
/// the reporting identity.
///
/// Serializes as
/// `{"timestamp": .., "userid": .., "optid": .., <attributes>.., "logData": [..], "total": n}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub timestamp: i64,
    #[serde(flatten)]
    pub identity: Identity,
    pub log_data: Vec<Entry>,
    pub total: usize,
}

impl Envelope {
    /// `None` for an empty batch; an envelope never carries zero entries.
    /// Attributes with reserved names are dropped from `identity`.
    #[must_use]
    pub fn new(timestamp: i64, mut identity: Identity, entries: Vec<Entry>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        identity.strip_reserved();
        Some(Envelope {
            timestamp,
            identity,
            total: entries.len(),
            log_data: entries,
        })
    }
}
