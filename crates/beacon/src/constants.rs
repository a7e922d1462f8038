// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline defaults.

/// `last_target` carried by the first entry of a category in a session.
pub const SESSION_START_TARGET: &str = "PAGE_LOAD";

/// Threshold applied to categories without their own threshold.
pub const DEFAULT_THRESHOLD: usize = 1;

/// Threshold shipped for the high-volume categories
/// (network-call, debug, performance, trace).
pub const HIGH_VOLUME_THRESHOLD: usize = 20;

/// Maximum number of delivery channels alive at once.
pub const DEFAULT_POOL_MAX_SIZE: usize = 3;

/// Wait between acquisition attempts while the pool is saturated.
pub const DEFAULT_POOL_RETRY_WAIT_MS: u64 = 100;

/// Channels whose reset takes longer than this are evicted from the pool.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Namespace of the durable slot.
pub const DEFAULT_STORAGE_NAMESPACE: &str = "beacon-storage";

/// Identity segment used when no actor identifier is known.
pub const ANONYMOUS: &str = "anonymous";

/// Payload field holding the event id attached by business-event logging.
pub const EVENT_ID_FIELD: &str = "eventId";

/// Capacity of the delivery notification channel. Slow subscribers lag
/// rather than block delivery.
pub(crate) const MAX_DELIVERY_EVENTS: usize = 100;
