// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery notifications.
//!
//! Every flush that produced an envelope ends in exactly one [`DeliveryEvent`].
//! Events are broadcast, so any number of collaborators can
//! [`EventBus::subscribe`]; nobody listening is not an error.
//!
//! ```text
//!   Dispatcher ──┬─ Persisted ───┐
//!                ├─ Inspected ───┤
//!   transmit ────┼─ Transmitted ─┼──> broadcast ──> subscribers (0..n)
//!     task       └─ Dropped ─────┘
//! ```

use tokio::sync::broadcast;

use crate::constants::MAX_DELIVERY_EVENTS;
use crate::entry::Category;

/// Why a batch left the pipeline without being delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DropReason {
    /// No channel became available within the configured acquire attempts.
    #[display("pool exhausted")]
    PoolExhausted,
    /// The channel could not issue the send.
    #[display("send failed")]
    SendFailed,
    /// The durable store rejected the write.
    #[display("store failed")]
    StoreFailed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A transmit channel issued the batch. This is not an acknowledgement from
    /// the collection endpoint.
    Transmitted { category: Category, count: usize },
    /// The batch was written to the durable store.
    Persisted { category: Category, count: usize },
    /// The batch was emitted through the inspect sink.
    Inspected { category: Category, count: usize },
    Dropped {
        category: Category,
        count: usize,
        reason: DropReason,
    },
}

impl DeliveryEvent {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            DeliveryEvent::Transmitted { category, .. }
            | DeliveryEvent::Persisted { category, .. }
            | DeliveryEvent::Inspected { category, .. }
            | DeliveryEvent::Dropped { category, .. } => *category,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(MAX_DELIVERY_EVENTS);
        EventBus { tx }
    }
}

impl EventBus {
    pub fn emit(&self, event: DeliveryEvent) {
        // Err only means there are no subscribers right now
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }
}
