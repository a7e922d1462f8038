// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types.
//!
//! Only configuration and handle errors ever reach callers. Store, channel and
//! pool failures are recovered inside the pipeline and reported through `tracing`.

/// Invalid or unparsable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failures reading or writing the durable recovery slot.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage contents could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Failures of a single delivery channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to construct delivery channel: {0}")]
    Construction(String),

    #[error("Failed to issue delivery: {0}")]
    Issue(String),

    #[error("Channel reset did not complete: {0}")]
    Reset(String),
}

/// Failures acquiring a channel from the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No delivery channel became available after {0} attempts")]
    Exhausted(u32),
}

/// Failures building a pipeline or talking to its service through a handle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open recovery store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to send {0} command: pipeline service is not running")]
    Send(&'static str),

    #[error("Failed to receive {0} response: pipeline service dropped the request")]
    Receive(&'static str),
}
