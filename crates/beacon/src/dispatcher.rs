// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{DumpMethod, PipelineConfig};
use crate::entry::Category;
use crate::envelope::Envelope;
use crate::events::{DeliveryEvent, DropReason, EventBus};
use crate::identity::Identity;
use crate::pool::ChannelPool;
use crate::queue::QueueManager;
use crate::store::RecoveryStore;

/// Receives envelopes flushed with the inspect method.
pub trait InspectSink: Send + Sync + Debug {
    fn inspect(&self, category: Category, envelope: &Envelope);
}

/// Writes inspected envelopes to the `beacon::inspect` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl InspectSink for TracingSink {
    fn inspect(&self, category: Category, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(json) => info!(target: "beacon::inspect", %category, total = envelope.total, "{json}"),
            Err(e) => warn!("Failed to render {} envelope for inspection: {}", category, e),
        }
    }
}

/// What a dump should flush, and how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpOptions {
    /// Flush only this category; every category when `None`.
    pub category: Option<Category>,
    /// Method for every flushed category without its own override.
    pub method: Option<DumpMethod>,
    /// Per-category methods, taking precedence over `method`.
    pub overrides: BTreeMap<Category, DumpMethod>,
}

impl DumpOptions {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn category(category: Category) -> Self {
        DumpOptions {
            category: Some(category),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: DumpMethod) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn with_override(mut self, category: Category, method: DumpMethod) -> Self {
        self.overrides.insert(category, method);
        self
    }
}

/// One envelope handed to a delivery method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub category: Category,
    pub method: DumpMethod,
    pub count: usize,
}

/// Every envelope a dump produced, in flush order. Categories with nothing
/// to flush are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub dispatched: Vec<Dispatched>,
}

impl DumpSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.dispatched.iter().map(|d| d.count).sum()
    }

    #[must_use]
    pub fn get(&self, category: Category) -> Option<&Dispatched> {
        self.dispatched.iter().find(|d| d.category == category)
    }
}

pub struct DispatcherConfig {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn RecoveryStore>,
    pub pool: ChannelPool,
    pub sink: Arc<dyn InspectSink>,
    pub events: EventBus,
    pub identity: Identity,
    pub clock: Arc<dyn Clock>,
}

/// Turns drained queues into envelopes and hands them to a delivery method.
///
/// Durable and inspect deliveries complete inside [`Dispatcher::flush`].
/// Transmit deliveries run as their own task so a saturated pool never holds up
/// the caller; [`Dispatcher::settle`] waits for them.
#[derive(Debug)]
pub struct Dispatcher {
    config: Arc<PipelineConfig>,
    store: Arc<dyn RecoveryStore>,
    pool: ChannelPool,
    sink: Arc<dyn InspectSink>,
    events: EventBus,
    identity: Identity,
    identity_key: String,
    clock: Arc<dyn Clock>,
    in_flight: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let identity_key = config.identity.key();
        Dispatcher {
            config: config.config,
            store: config.store,
            pool: config.pool,
            sink: config.sink,
            events: config.events,
            identity: config.identity,
            identity_key,
            clock: config.clock,
            in_flight: Vec::new(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Method used for `category`: its override in `options`, then
    /// `options.method`, then the configured default. Transmit degrades to
    /// durable when no endpoint is configured.
    #[must_use]
    pub fn resolve_method(&self, category: Category, options: &DumpOptions) -> DumpMethod {
        let method = options
            .overrides
            .get(&category)
            .copied()
            .or(options.method)
            .unwrap_or_else(|| self.config.method_for(category));
        if method == DumpMethod::Transmit && self.config.endpoint.is_none() {
            debug!("No endpoint configured, persisting {} instead of transmitting", category);
            return DumpMethod::Durable;
        }
        method
    }

    /// Flush one category. `None` when there was nothing to deliver, in which
    /// case no delivery method ran.
    pub fn flush(
        &mut self,
        queues: &mut QueueManager,
        category: Category,
        options: &DumpOptions,
    ) -> Option<Dispatched> {
        let method = self.resolve_method(category, options);
        let entries = queues.take_batch(category);
        let envelope = Envelope::new(self.clock.now_millis(), self.identity.clone(), entries)?;
        let count = envelope.total;
        debug!("Flushing {} {} entries with {}", count, category, method);

        match method {
            DumpMethod::Durable => self.persist(queues, category, envelope),
            DumpMethod::Inspect => {
                self.sink.inspect(category, &envelope);
                self.clear_slot(category);
                self.events
                    .emit(DeliveryEvent::Inspected { category, count });
            }
            DumpMethod::Transmit => {
                // cleared before the send task exists, so a later durable flush
                // of this category cannot be wiped by it
                self.clear_slot(category);
                self.transmit(category, envelope);
            }
        }

        Some(Dispatched {
            category,
            method,
            count,
        })
    }

    /// Flush the category named in `options`, or every category in
    /// [`Category::ALL`] order.
    pub fn dump(&mut self, queues: &mut QueueManager, options: &DumpOptions) -> DumpSummary {
        let categories = match options.category {
            Some(category) => vec![category],
            None => Category::ALL.to_vec(),
        };
        let dispatched = categories
            .into_iter()
            .filter_map(|category| self.flush(queues, category, options))
            .collect();
        DumpSummary { dispatched }
    }

    /// Wait for every transmit task started so far.
    pub async fn settle(&mut self) {
        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                error!("Transmit task failed: {}", e);
            }
        }
    }

    fn persist(&self, queues: &mut QueueManager, category: Category, envelope: Envelope) {
        let count = envelope.total;
        match self
            .store
            .save(&self.identity_key, category, &envelope.log_data)
        {
            Ok(()) => {
                queues.mark_persisted(category);
                self.events.emit(DeliveryEvent::Persisted { category, count });
            }
            Err(e) => {
                error!("Failed to persist {} {} entries: {}", count, category, e);
                self.events.emit(DeliveryEvent::Dropped {
                    category,
                    count,
                    reason: DropReason::StoreFailed,
                });
            }
        }
    }

    fn clear_slot(&self, category: Category) {
        if let Err(e) = self.store.clear(&self.identity_key, category) {
            error!("Failed to clear stored {} entries: {}", category, e);
        }
    }

    fn transmit(&mut self, category: Category, envelope: Envelope) {
        let Some(endpoint) = self.config.endpoint.clone() else {
            return;
        };
        let pool = self.pool.clone();
        let events = self.events.clone();
        let count = envelope.total;

        self.in_flight.retain(|handle| !handle.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            let mut channel = match pool.acquire().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Dropping {} {} entries: {}", count, category, e);
                    events.emit(DeliveryEvent::Dropped {
                        category,
                        count,
                        reason: DropReason::PoolExhausted,
                    });
                    return;
                }
            };

            let sent = channel.send(&endpoint, &envelope).await;
            pool.release(channel).await;
            match sent {
                Ok(()) => events.emit(DeliveryEvent::Transmitted { category, count }),
                Err(e) => {
                    warn!("Dropping {} {} entries: {}", count, category, e);
                    events.emit(DeliveryEvent::Dropped {
                        category,
                        count,
                        reason: DropReason::SendFailed,
                    });
                }
            }
        }));
    }
}
