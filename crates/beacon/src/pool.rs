// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of reusable delivery channels.
//!
//! Every channel the pool knows about is either *available* or *in use*, never
//! both, and the two together never exceed `max_size`. A channel returns to
//! *available* only after its reset completed; a channel whose reset fails or
//! times out is evicted and counted as lost, which frees its slot for a
//! replacement.
//!
//! Without a reset timeout there is no point at which a stalled reset can be
//! declared lost, so the channel gives up its slot as soon as the reset starts
//! and sits in a separate *resetting* set. If the pool refilled the slot by
//! the time the reset completes, the channel is retired instead of returned.
//!
//! ```text
//!              acquire()                       release()
//!   available ───────────> in use ──> reset ──┬── ok ──────────> available
//!       ^                                     └── err/timeout ─> lost
//!       │ build (while below max_size)
//!   ChannelFactory
//! ```
//!
//! When the pool is saturated, `acquire` polls at a fixed interval rather than
//! queueing. Several pending acquisitions may race for one freed channel; the
//! first to look wins and the rest keep polling.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fnv::FnvBuildHasher;
use hashbrown::HashSet;
use tracing::{debug, warn};

use crate::channel::{ChannelFactory, DeliveryChannel};
use crate::config::PoolConfig;
use crate::envelope::Envelope;
use crate::errors::{ChannelError, PoolError};

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    /// Channels resetting outside the pool's capacity, which only happens
    /// without a reset timeout.
    pub resetting: usize,
    /// Channels built over the pool's lifetime.
    pub created: u64,
    /// Channels evicted because their reset failed, timed out, or they were
    /// never released, plus channels retired after a late reset.
    pub lost: u64,
    /// Factory calls that failed to produce a channel.
    pub failed_builds: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<Box<dyn DeliveryChannel>>,
    in_use: HashSet<u64, FnvBuildHasher>,
    resetting: HashSet<u64, FnvBuildHasher>,
    next_id: u64,
    created: u64,
    lost: u64,
    failed_builds: u64,
}

impl PoolState {
    fn size(&self) -> usize {
        self.available.len() + self.in_use.len()
    }
}

#[derive(Debug)]
struct PoolInner {
    factory: Arc<dyn ChannelFactory>,
    max_size: usize,
    retry_wait: Duration,
    acquire_max_attempts: Option<u32>,
    reset_timeout: Option<Duration>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        // bookkeeping never panics mid-update, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, id: u64, reason: &str) {
        let mut state = self.state();
        if state.in_use.remove(&id) || state.resetting.remove(&id) {
            state.lost += 1;
            warn!("Evicted delivery channel {}: {}", id, reason);
        }
    }

    /// Stop counting `id` against `max_size` while its reset runs.
    fn detach(&self, id: u64) {
        let mut state = self.state();
        if state.in_use.remove(&id) {
            state.resetting.insert(id);
        }
    }

    fn restore(&self, channel: Box<dyn DeliveryChannel>) {
        let id = channel.id();
        let mut state = self.state();
        if state.in_use.remove(&id) {
            state.available.push_back(channel);
            debug!("Released delivery channel {}", id);
        } else if state.resetting.remove(&id) {
            if state.size() < self.max_size {
                state.available.push_back(channel);
                debug!("Released delivery channel {} after a detached reset", id);
            } else {
                state.lost += 1;
                debug!("Retired delivery channel {}: pool refilled during its reset", id);
            }
        }
    }
}

/// Shared handle to a channel pool. Clones refer to the same pool.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    #[must_use]
    pub fn new(factory: Arc<dyn ChannelFactory>, config: &PoolConfig) -> Self {
        ChannelPool {
            inner: Arc::new(PoolInner {
                factory,
                max_size: config.max_size,
                retry_wait: config.retry_wait(),
                acquire_max_attempts: config.acquire_max_attempts,
                reset_timeout: config.reset_timeout(),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Lend a channel, waiting while the pool is saturated.
    ///
    /// Fails only when `acquire_max_attempts` is configured and that many
    /// attempts found no channel.
    pub async fn acquire(&self) -> Result<PooledChannel, PoolError> {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            if let Some(channel) = self.try_acquire() {
                debug!(
                    "Acquired delivery channel {} after {} attempt(s)",
                    channel.id(),
                    attempts
                );
                return Ok(PooledChannel {
                    channel: Some(channel),
                    pool: Arc::clone(&self.inner),
                });
            }
            if let Some(max_attempts) = self.inner.acquire_max_attempts {
                if attempts >= max_attempts {
                    return Err(PoolError::Exhausted(attempts));
                }
            }
            self.wait_for_availability().await;
        }
    }

    /// Reset `channel` and return it to the available set. A channel whose
    /// reset fails or exceeds the reset timeout is evicted instead. Without a
    /// reset timeout the channel's slot is freed for the duration of the reset.
    pub async fn release(&self, mut channel: PooledChannel) {
        let Some(mut inner_channel) = channel.channel.take() else {
            return;
        };
        let id = inner_channel.id();

        let reset = match channel.pool.reset_timeout {
            Some(timeout) => tokio::time::timeout(timeout, inner_channel.reset())
                .await
                .unwrap_or_else(|_| {
                    Err(ChannelError::Reset(format!(
                        "no reset within {}ms",
                        timeout.as_millis()
                    )))
                }),
            None => {
                channel.pool.detach(id);
                inner_channel.reset().await
            }
        };

        match reset {
            Ok(()) => channel.pool.restore(inner_channel),
            Err(e) => channel.pool.evict(id, &e.to_string()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            available: state.available.len(),
            in_use: state.in_use.len(),
            resetting: state.resetting.len(),
            created: state.created,
            lost: state.lost,
            failed_builds: state.failed_builds,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Take an available channel, building one first when none is available
    /// and the pool has room. A freshly built channel goes through the
    /// available set like any other.
    fn try_acquire(&self) -> Option<Box<dyn DeliveryChannel>> {
        let mut state = self.inner.state();
        if state.available.is_empty() && state.size() < self.inner.max_size {
            let id = state.next_id;
            state.next_id += 1;
            match self.inner.factory.build(id) {
                Ok(channel) => {
                    state.created += 1;
                    state.available.push_back(channel);
                }
                Err(e) => {
                    state.failed_builds += 1;
                    warn!("Failed to build delivery channel {}: {}", id, e);
                }
            }
        }
        let channel = state.available.pop_front()?;
        state.in_use.insert(channel.id());
        Some(channel)
    }

    // The only place acquisition waits. Returns once it is worth looking again.
    async fn wait_for_availability(&self) {
        tokio::time::sleep(self.inner.retry_wait).await;
    }
}

/// A channel on loan from a [`ChannelPool`].
///
/// Hand it back with [`ChannelPool::release`]. A guard dropped without being
/// released is evicted from the pool, since its reset state is unknown.
#[derive(Debug)]
pub struct PooledChannel {
    channel: Option<Box<dyn DeliveryChannel>>,
    pool: Arc<PoolInner>,
}

impl PooledChannel {
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.channel.as_ref().map(|channel| channel.id())
    }

    pub async fn send(&mut self, endpoint: &str, envelope: &Envelope) -> Result<(), ChannelError> {
        match self.channel.as_mut() {
            Some(channel) => channel.send(endpoint, envelope).await,
            None => Err(ChannelError::Issue("channel already released".to_string())),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.evict(channel.id(), "dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum ResetBehavior {
        Succeed,
        Fail,
        Hang,
        /// Completes once the factory's gate is notified.
        Gated,
    }

    #[derive(Debug)]
    struct FakeChannel {
        id: u64,
        reset: ResetBehavior,
        sends: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl DeliveryChannel for FakeChannel {
        fn id(&self) -> u64 {
            self.id
        }

        async fn send(&mut self, _endpoint: &str, _envelope: &Envelope) -> Result<(), ChannelError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&mut self) -> Result<(), ChannelError> {
            match self.reset {
                ResetBehavior::Succeed => Ok(()),
                ResetBehavior::Fail => Err(ChannelError::Reset("host torn down".to_string())),
                ResetBehavior::Hang => std::future::pending().await,
                ResetBehavior::Gated => {
                    self.gate.notified().await;
                    Ok(())
                }
            }
        }
    }

    #[derive(Debug)]
    struct FakeFactory {
        reset: Mutex<ResetBehavior>,
        failures_left: AtomicU32,
        sends: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    impl FakeFactory {
        fn new(reset: ResetBehavior) -> Arc<Self> {
            Arc::new(FakeFactory {
                reset: Mutex::new(reset),
                failures_left: AtomicU32::new(0),
                sends: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(Notify::new()),
            })
        }

        fn set_reset(&self, reset: ResetBehavior) {
            *self.reset.lock().unwrap() = reset;
        }
    }

    impl ChannelFactory for FakeFactory {
        fn build(&self, id: u64) -> Result<Box<dyn DeliveryChannel>, ChannelError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChannelError::Construction("no host document".to_string()));
            }
            Ok(Box::new(FakeChannel {
                id,
                reset: *self.reset.lock().unwrap(),
                sends: Arc::clone(&self.sends),
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    fn pool_config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            retry_wait_ms: 100,
            acquire_max_attempts: None,
            reset_timeout_ms: Some(1_000),
        }
    }

    #[tokio::test]
    async fn test_acquire_builds_then_reuses() {
        let pool = ChannelPool::new(FakeFactory::new(ResetBehavior::Succeed), &pool_config(3));

        let channel = pool.acquire().await.unwrap();
        assert_eq!(channel.id(), Some(0));
        assert_eq!(pool.stats().in_use, 1);
        pool.release(channel).await;

        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.created), (1, 0, 1));

        let channel = pool.acquire().await.unwrap();
        assert_eq!(channel.id(), Some(0));
        pool.release(channel).await;
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_acquire_waits_for_release() {
        let pool = ChannelPool::new(FakeFactory::new(ResetBehavior::Succeed), &pool_config(2));
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(!waiter.is_finished());
        let stats = pool.stats();
        assert!(stats.available + stats.in_use <= pool.max_size());
        assert_eq!(stats.created, 2);

        pool.release(first).await;
        let third = waiter.await.unwrap().unwrap();
        assert_eq!(third.id(), Some(0));
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_max_attempts_exhausts() {
        let config = PoolConfig {
            acquire_max_attempts: Some(3),
            ..pool_config(1)
        };
        let pool = ChannelPool::new(FakeFactory::new(ResetBehavior::Succeed), &config);
        let _held = pool.acquire().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(matches!(pool.acquire().await, Err(PoolError::Exhausted(3))));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_failed_reset_evicts_channel() {
        let factory = FakeFactory::new(ResetBehavior::Fail);
        let pool = ChannelPool::new(factory.clone(), &pool_config(1));

        let channel = pool.acquire().await.unwrap();
        pool.release(channel).await;
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.lost), (0, 0, 1));

        // the lost slot is reusable for a replacement
        factory.set_reset(ResetBehavior::Succeed);
        let replacement = pool.acquire().await.unwrap();
        assert_eq!(replacement.id(), Some(1));
        pool.release(replacement).await;
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reset_times_out() {
        let pool = ChannelPool::new(FakeFactory::new(ResetBehavior::Hang), &pool_config(1));
        let channel = pool.acquire().await.unwrap();

        let release = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.release(channel).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        // still resetting, so still occupying its slot
        assert_eq!(pool.stats().in_use, 1);

        release.await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.in_use, stats.lost), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_reset_frees_its_slot() {
        let factory = FakeFactory::new(ResetBehavior::Hang);
        let config = PoolConfig {
            acquire_max_attempts: Some(50),
            reset_timeout_ms: None,
            ..pool_config(1)
        };
        let pool = ChannelPool::new(factory.clone(), &config);
        let stalled = pool.acquire().await.unwrap();

        let release = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.release(stalled).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.resetting), (0, 0, 1));

        factory.set_reset(ResetBehavior::Succeed);
        let replacement = pool.acquire().await.unwrap();
        assert_eq!(replacement.id(), Some(1));
        pool.release(replacement).await;
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.created), (1, 0, 2));
        release.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reset_is_retired_when_pool_refilled() {
        let factory = FakeFactory::new(ResetBehavior::Gated);
        let config = PoolConfig {
            reset_timeout_ms: None,
            ..pool_config(1)
        };
        let pool = ChannelPool::new(factory.clone(), &config);
        let slow = pool.acquire().await.unwrap();

        let release = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.release(slow).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.set_reset(ResetBehavior::Succeed);
        let replacement = pool.acquire().await.unwrap();

        factory.gate.notify_one();
        release.await.unwrap();
        let stats = pool.stats();
        assert_eq!(
            (stats.available, stats.in_use, stats.resetting, stats.lost),
            (0, 1, 0, 1)
        );

        pool.release(replacement).await;
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_reset_returns_channel_when_room() {
        let factory = FakeFactory::new(ResetBehavior::Gated);
        let config = PoolConfig {
            reset_timeout_ms: None,
            ..pool_config(1)
        };
        let pool = ChannelPool::new(factory.clone(), &config);
        let channel = pool.acquire().await.unwrap();

        factory.gate.notify_one();
        pool.release(channel).await;
        let stats = pool.stats();
        assert_eq!((stats.available, stats.resetting, stats.lost), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_dropped_guard_is_evicted() {
        let pool = ChannelPool::new(FakeFactory::new(ResetBehavior::Succeed), &pool_config(1));
        drop(pool.acquire().await.unwrap());
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.lost), (0, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_is_counted_and_retried() {
        let factory = FakeFactory::new(ResetBehavior::Succeed);
        factory.failures_left.store(2, Ordering::SeqCst);
        let pool = ChannelPool::new(factory, &pool_config(1));

        let channel = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.failed_builds, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(channel.id(), Some(2));
        pool.release(channel).await;
    }

    #[tokio::test]
    async fn test_pooled_channel_send() {
        let factory = FakeFactory::new(ResetBehavior::Succeed);
        let pool = ChannelPool::new(factory.clone(), &pool_config(1));
        let envelope = Envelope {
            timestamp: 1,
            identity: crate::identity::Identity::default(),
            log_data: Vec::new(),
            total: 0,
        };

        let mut channel = pool.acquire().await.unwrap();
        channel.send("http://collector", &envelope).await.unwrap();
        pool.release(channel).await;
        assert_eq!(factory.sends.load(Ordering::SeqCst), 1);
    }
}
