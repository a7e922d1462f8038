// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side telemetry pipeline.
//!
//! Instrumentation code reports entries through a [`service::PipelineHandle`]. The
//! pipeline buffers them per [`entry::Category`], flushes a category once its queue
//! reaches the configured threshold, and hands each batch to one of three delivery
//! methods: persist it to the durable [`store::RecoveryStore`], print it through an
//! inspect sink, or transmit it through a bounded [`pool::ChannelPool`] of reusable
//! delivery channels.
//!
//! ```text
//!   log() ──> PipelineService ──> QueueManager ──(threshold)──> Dispatcher
//!                                     ^                          │
//!                                     │ merge once               ├─ durable  ─> RecoveryStore
//!                              RecoveryStore                     ├─ inspect  ─> InspectSink
//!                                                                └─ transmit ─> ChannelPool ─> DeliveryChannel
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod channel;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod entry;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod identity;
pub mod pool;
pub mod queue;
pub mod service;
pub mod store;
pub mod util;
