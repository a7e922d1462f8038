// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spy implementations of the pipeline's delivery collaborators

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beacon::channel::{ChannelFactory, DeliveryChannel};
use beacon::dispatcher::InspectSink;
use beacon::entry::{Category, Entry};
use beacon::envelope::Envelope;
use beacon::errors::{ChannelError, StoreError};
use beacon::store::{MemoryStore, RecoveryStore};
use tokio::sync::Semaphore;

/// Inspect sink remembering every envelope it was handed.
#[derive(Debug, Default)]
pub struct SpySink {
    pub envelopes: Mutex<Vec<(Category, Envelope)>>,
}

impl SpySink {
    pub fn count(&self) -> usize {
        self.envelopes.lock().unwrap().len()
    }
}

impl InspectSink for SpySink {
    fn inspect(&self, category: Category, envelope: &Envelope) {
        self.envelopes
            .lock()
            .unwrap()
            .push((category, envelope.clone()));
    }
}

/// Memory store counting durable writes, so tests can tell a durable flush
/// from the store traffic of recovery merges.
#[derive(Debug, Clone, Default)]
pub struct SpyStore {
    pub inner: MemoryStore,
    pub saves: Arc<AtomicUsize>,
}

impl SpyStore {
    pub fn over(inner: MemoryStore) -> Self {
        SpyStore {
            inner,
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecoveryStore for SpyStore {
    fn save(&self, identity_key: &str, category: Category, entries: &[Entry]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(identity_key, category, entries)
    }

    fn load(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        self.inner.load(identity_key, category)
    }

    fn clear(&self, identity_key: &str, category: Category) -> Result<(), StoreError> {
        self.inner.clear(identity_key, category)
    }

    fn take(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        self.inner.take(identity_key, category)
    }
}

/// Shared record of what every channel built by a [`SpyFactory`] did.
#[derive(Debug, Default)]
pub struct ChannelLog {
    pub sent: Mutex<Vec<Envelope>>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ChannelLog {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

/// Channel factory whose channels record sends and, when gated, hold their
/// reset until the test adds permits to the gate.
#[derive(Debug, Default)]
pub struct SpyFactory {
    pub log: Arc<ChannelLog>,
    pub gate: Option<Arc<Semaphore>>,
    pub built: AtomicUsize,
}

impl SpyFactory {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        SpyFactory {
            gate: Some(gate),
            ..Default::default()
        }
    }
}

impl ChannelFactory for SpyFactory {
    fn build(&self, id: u64) -> Result<Box<dyn DeliveryChannel>, ChannelError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SpyChannel {
            id,
            log: Arc::clone(&self.log),
            gate: self.gate.clone(),
            busy: false,
        }))
    }
}

#[derive(Debug)]
pub struct SpyChannel {
    id: u64,
    log: Arc<ChannelLog>,
    gate: Option<Arc<Semaphore>>,
    busy: bool,
}

#[async_trait]
impl DeliveryChannel for SpyChannel {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&mut self, _endpoint: &str, envelope: &Envelope) -> Result<(), ChannelError> {
        let active = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active.fetch_max(active, Ordering::SeqCst);
        self.busy = true;
        self.log.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ChannelError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ChannelError::Reset(e.to_string()))?
                .forget();
        }
        if self.busy {
            self.busy = false;
            self.log.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
