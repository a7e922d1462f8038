// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-category in-memory queues.
//!
//! The [`QueueManager`] owns one ordered buffer per [`Category`] and decides when
//! a category is due for a flush. It never flushes by itself: [`QueueManager::enqueue`]
//! only reports that a flush should be scheduled, and the caller runs it later.
//!
//! # Recovery merge
//!
//! The first time a category is enqueued to or flushed, entries left in the
//! durable store by an earlier session are taken out of the store and placed
//! ahead of everything queued in memory. The category is then *reconciled* and
//! the store is not consulted again until a durable flush writes the category's
//! slot, at which point the next touch picks the freshly persisted entries back
//! up.

use std::collections::VecDeque;
use std::sync::Arc;

use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, error};

use crate::config::PipelineConfig;
use crate::constants::SESSION_START_TARGET;
use crate::entry::{Category, Entry, LogRecord};
use crate::store::RecoveryStore;

#[derive(Debug)]
pub struct QueueManager {
    config: Arc<PipelineConfig>,
    store: Arc<dyn RecoveryStore>,
    identity_key: String,
    queues: HashMap<Category, VecDeque<Entry>, FnvBuildHasher>,
    last_targets: HashMap<Category, String, FnvBuildHasher>,
    reconciled: HashSet<Category, FnvBuildHasher>,
    pending_flush: HashSet<Category, FnvBuildHasher>,
}

impl QueueManager {
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn RecoveryStore>,
        identity_key: impl Into<String>,
    ) -> Self {
        QueueManager {
            config,
            store,
            identity_key: identity_key.into(),
            queues: HashMap::default(),
            last_targets: HashMap::default(),
            reconciled: HashSet::default(),
            pending_flush: HashSet::default(),
        }
    }

    #[must_use]
    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    /// Append `record` to its category's queue.
    ///
    /// Returns `true` when the queue reached its threshold and no flush is
    /// pending for the category yet. The caller must schedule exactly one flush
    /// in that case; until that flush runs, further enqueues return `false`.
    pub fn enqueue(&mut self, record: LogRecord) -> bool {
        let category = record.category;
        self.merge(category);

        let last_target = self
            .last_targets
            .get(&category)
            .cloned()
            .unwrap_or_else(|| SESSION_START_TARGET.to_string());
        let entry = Entry::from_record(record, last_target);
        self.last_targets.insert(category, entry.target.clone());

        let queue = self.queues.entry(category).or_default();
        queue.push_back(entry);
        let size = queue.len();

        let threshold = self.config.threshold_for(category);
        if size >= threshold && self.pending_flush.insert(category) {
            debug!(
                "Queue for {} reached threshold {} with {} entries, scheduling flush",
                category, threshold, size
            );
            return true;
        }
        false
    }

    #[must_use]
    pub fn size(&self, category: Category) -> usize {
        self.queues.get(&category).map_or(0, VecDeque::len)
    }

    /// Remove and return every queued entry of `category`, oldest first.
    pub fn drain(&mut self, category: Category) -> Vec<Entry> {
        self.queues
            .get_mut(&category)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Merge any durable backlog, then drain. This is what a flush delivers.
    pub fn take_batch(&mut self, category: Category) -> Vec<Entry> {
        self.pending_flush.remove(&category);
        self.merge(category);
        self.drain(category)
    }

    /// Whether a threshold flush is scheduled but has not run yet.
    #[must_use]
    pub fn is_flush_pending(&self, category: Category) -> bool {
        self.pending_flush.contains(&category)
    }

    /// Record that a durable flush wrote the slot of `category`, so the next
    /// enqueue or flush recovers it.
    pub fn mark_persisted(&mut self, category: Category) {
        self.reconciled.remove(&category);
    }

    /// One-time merge of the durable backlog into the front of the queue. A
    /// failed read leaves the category unreconciled so the next touch retries.
    fn merge(&mut self, category: Category) {
        if self.reconciled.contains(&category) {
            return;
        }
        let recovered = match self.store.take(&self.identity_key, category) {
            Ok(recovered) => recovered,
            Err(e) => {
                error!("Failed to recover stored {} entries: {}", category, e);
                return;
            }
        };
        self.reconciled.insert(category);
        if recovered.is_empty() {
            return;
        }

        debug!("Recovered {} stored {} entries", recovered.len(), category);
        let queue = self.queues.entry(category).or_default();
        let current: Vec<Entry> = queue.drain(..).collect();
        queue.extend(recovered);
        queue.extend(current);
    }
}
