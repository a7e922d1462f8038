// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pipeline actor.
//!
//! A single [`PipelineService`] task owns the queues and processes commands one
//! at a time; producers talk to it through cloneable [`PipelineHandle`]s. When a
//! log crosses its category's threshold, the service does not flush on the spot:
//! it posts a flush command to the tail of its own command channel, so the flush
//! runs after every command already waiting.
//!
//! ```text
//!   PipelineHandle ──Log/Dump/Size/Drain──> mpsc ──> PipelineService::run
//!                                            ^              │
//!                                            └─ScheduledFlush┘
//! ```

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{ChannelFactory, HttpChannelFactory};
use crate::clock::{Clock, NavigationState, PathProvider, SystemClock};
use crate::config::PipelineConfig;
use crate::constants::EVENT_ID_FIELD;
use crate::dispatcher::{
    Dispatcher, DispatcherConfig, DumpOptions, DumpSummary, InspectSink, TracingSink,
};
use crate::entry::{Category, Entry, LogRecord};
use crate::errors::PipelineError;
use crate::events::{DeliveryEvent, EventBus};
use crate::identity::IdentityFactory;
use crate::pool::{ChannelPool, PoolStats};
use crate::queue::QueueManager;
use crate::store::{self, RecoveryStore};

#[derive(Debug)]
pub enum PipelineCommand {
    Log(LogRecord),
    ScheduledFlush(Category),
    Dump {
        options: DumpOptions,
        response_tx: oneshot::Sender<DumpSummary>,
    },
    Size {
        category: Category,
        response_tx: oneshot::Sender<usize>,
    },
    Drain {
        category: Category,
        response_tx: oneshot::Sender<Vec<Entry>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Producer-side handle. Cheap to clone; every clone feeds the same service.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
    clock: Arc<dyn Clock>,
    paths: Arc<dyn PathProvider>,
    events: EventBus,
    pool: ChannelPool,
}

impl PipelineHandle {
    /// Log `payload` under the custom category.
    pub fn log(&self, payload: Value, target: Option<&str>) -> Result<(), PipelineError> {
        self.log_with_category(payload, Category::Custom, target)
    }

    /// Log `payload` under `category`. Timestamp and path are captured now; the
    /// call never waits on delivery.
    pub fn log_with_category(
        &self,
        payload: Value,
        category: Category,
        target: Option<&str>,
    ) -> Result<(), PipelineError> {
        let record = LogRecord {
            timestamp: self.clock.now_millis(),
            category,
            target: target.map(str::to_string),
            path: self.paths.current_path(),
            payload,
        };
        self.tx
            .send(PipelineCommand::Log(record))
            .map_err(|_| PipelineError::Send("log"))
    }

    /// Log a business event under a fresh event id, returned to the caller.
    ///
    /// Object payloads get the id added as `eventId`; anything else is wrapped
    /// as `{"data": payload, "eventId": id}`.
    pub fn log_business(&self, payload: Value, target: Option<&str>) -> Result<Uuid, PipelineError> {
        let event_id = Uuid::new_v4();
        let payload = match payload {
            Value::Object(mut fields) => {
                fields.insert(EVENT_ID_FIELD.to_string(), json!(event_id.to_string()));
                Value::Object(fields)
            }
            other => json!({ "data": other, EVENT_ID_FIELD: event_id.to_string() }),
        };
        self.log_with_category(payload, Category::BusinessEvent, target)?;
        Ok(event_id)
    }

    /// Flush now. Returns once every envelope has been handed to its delivery
    /// method; transmissions may still be in flight.
    pub async fn dump(&self, options: DumpOptions) -> Result<DumpSummary, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Dump {
                options,
                response_tx,
            })
            .map_err(|_| PipelineError::Send("dump"))?;
        response_rx
            .await
            .map_err(|_| PipelineError::Receive("dump"))
    }

    pub async fn size(&self, category: Category) -> Result<usize, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Size {
                category,
                response_tx,
            })
            .map_err(|_| PipelineError::Send("size"))?;
        response_rx
            .await
            .map_err(|_| PipelineError::Receive("size"))
    }

    /// Remove the queued entries of `category` without delivering them.
    pub async fn drain(&self, category: Category) -> Result<Vec<Entry>, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Drain {
                category,
                response_tx,
            })
            .map_err(|_| PipelineError::Send("drain"))?;
        response_rx
            .await
            .map_err(|_| PipelineError::Receive("drain"))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the service after in-flight transmissions settle. Queued entries
    /// are not flushed; dump first to deliver them.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Shutdown(response_tx))
            .map_err(|_| PipelineError::Send("shutdown"))?;
        response_rx
            .await
            .map_err(|_| PipelineError::Receive("shutdown"))
    }
}

/// Assembles a pipeline, defaulting every collaborator that is not supplied.
#[derive(Debug)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    identity: IdentityFactory,
    store: Option<Arc<dyn RecoveryStore>>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    sink: Option<Arc<dyn InspectSink>>,
    clock: Option<Arc<dyn Clock>>,
    paths: Option<Arc<dyn PathProvider>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder {
            config,
            identity: IdentityFactory::new_from_static(Default::default()),
            store: None,
            channel_factory: None,
            sink: None,
            clock: None,
            paths: None,
        }
    }

    #[must_use]
    pub fn identity(mut self, identity: IdentityFactory) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn RecoveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn inspect_sink(mut self, sink: Arc<dyn InspectSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn paths(mut self, paths: Arc<dyn PathProvider>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Validate the configuration and wire the service to its first handle.
    /// Without an explicit store, one is opened from the configuration.
    pub fn build(self) -> Result<(PipelineService, PipelineHandle), PipelineError> {
        self.config.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => store::from_config(&self.config)?,
        };
        let factory = self
            .channel_factory
            .unwrap_or_else(|| Arc::new(HttpChannelFactory::from_config(&self.config)));
        let pool = ChannelPool::new(factory, &self.config.pool);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = EventBus::default();

        let (tx, rx) = mpsc::unbounded_channel();
        let service = PipelineService {
            rx,
            scheduler: tx.downgrade(),
            config: Arc::new(self.config),
            identity: self.identity,
            store,
            pool: pool.clone(),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            events: events.clone(),
            clock: Arc::clone(&clock),
        };
        let handle = PipelineHandle {
            tx,
            clock,
            paths: self
                .paths
                .unwrap_or_else(|| Arc::new(NavigationState::default())),
            events,
            pool,
        };
        Ok((service, handle))
    }
}

pub struct PipelineService {
    rx: mpsc::UnboundedReceiver<PipelineCommand>,
    // weak, so the service stops once every handle is gone
    scheduler: mpsc::WeakUnboundedSender<PipelineCommand>,
    config: Arc<PipelineConfig>,
    identity: IdentityFactory,
    store: Arc<dyn RecoveryStore>,
    pool: ChannelPool,
    sink: Arc<dyn InspectSink>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl PipelineService {
    /// Build a pipeline with default collaborators.
    pub fn new(
        config: PipelineConfig,
        identity: IdentityFactory,
    ) -> Result<(Self, PipelineHandle), PipelineError> {
        PipelineBuilder::new(config).identity(identity).build()
    }

    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub async fn run(mut self) {
        let identity = self.identity.get_identity().await.clone();
        debug!("Pipeline service started for {}", identity.key());

        let mut queues = QueueManager::new(
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            identity.key(),
        );
        let mut dispatcher = Dispatcher::new(DispatcherConfig {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            pool: self.pool.clone(),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            identity,
            clock: Arc::clone(&self.clock),
        });

        while let Some(command) = self.rx.recv().await {
            match command {
                PipelineCommand::Log(record) => {
                    let category = record.category;
                    if queues.enqueue(record) {
                        self.schedule_flush(category, &mut queues, &mut dispatcher);
                    }
                }

                PipelineCommand::ScheduledFlush(category) => {
                    dispatcher.flush(&mut queues, category, &DumpOptions::category(category));
                }

                PipelineCommand::Dump {
                    options,
                    response_tx,
                } => {
                    let summary = dispatcher.dump(&mut queues, &options);
                    if response_tx.send(summary).is_err() {
                        warn!("Failed to send dump response - receiver dropped");
                    }
                }

                PipelineCommand::Size {
                    category,
                    response_tx,
                } => {
                    if response_tx.send(queues.size(category)).is_err() {
                        error!("Failed to send size response - receiver dropped");
                    }
                }

                PipelineCommand::Drain {
                    category,
                    response_tx,
                } => {
                    if response_tx.send(queues.drain(category)).is_err() {
                        error!("Failed to send drain response - receiver dropped");
                    }
                }

                PipelineCommand::Shutdown(response_tx) => {
                    debug!("Pipeline service shutting down");
                    dispatcher.settle().await;
                    let _ = response_tx.send(());
                    break;
                }
            }
        }

        dispatcher.settle().await;
        debug!("Pipeline service stopped");
    }

    /// Queue a flush of `category` behind every command already waiting. With
    /// no handle left to post through, flush right away instead: nothing else
    /// can arrive anyway.
    fn schedule_flush(
        &self,
        category: Category,
        queues: &mut QueueManager,
        dispatcher: &mut Dispatcher,
    ) {
        let posted = self
            .scheduler
            .upgrade()
            .is_some_and(|tx| tx.send(PipelineCommand::ScheduledFlush(category)).is_ok());
        if !posted {
            dispatcher.flush(queues, category, &DumpOptions::category(category));
        }
    }
}
