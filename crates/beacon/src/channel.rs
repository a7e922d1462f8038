// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery channels.
//!
//! A channel performs one send at a time and must be reset before it is reused.
//! `send` only *issues* the transport call; `reset` waits for that call to settle
//! and returns the channel to a neutral state. There is no acknowledgement from
//! the collection endpoint at any point.

use std::fmt::Debug;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zstd::stream::write::Encoder;

use crate::config::PipelineConfig;
use crate::envelope::Envelope;
use crate::errors::ChannelError;

#[async_trait]
pub trait DeliveryChannel: Send + Sync + Debug {
    fn id(&self) -> u64;

    /// Issue the delivery of `envelope` to `endpoint`. Returns once the
    /// transport call is under way.
    async fn send(&mut self, endpoint: &str, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Wait for the previous send to settle. A channel is only reusable after a
    /// successful reset.
    async fn reset(&mut self) -> Result<(), ChannelError>;
}

/// Builds the channels a pool hands out.
pub trait ChannelFactory: Send + Sync + Debug {
    fn build(&self, id: u64) -> Result<Box<dyn DeliveryChannel>, ChannelError>;
}

/// Channel posting envelopes as JSON over HTTP, optionally zstd-compressed.
#[derive(Debug)]
pub struct HttpChannel {
    id: u64,
    client: reqwest::Client,
    compression_level: Option<i32>,
    in_flight: Option<JoinHandle<()>>,
}

impl HttpChannel {
    pub fn new(
        id: u64,
        request_timeout: Duration,
        compression_level: Option<i32>,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(Some(Duration::from_secs(270)))
            .tcp_keepalive(Some(Duration::from_secs(120)))
            .build()
            .map_err(|e| ChannelError::Construction(e.to_string()))?;
        Ok(HttpChannel {
            id,
            client,
            compression_level,
            in_flight: None,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        headers
    }

    fn body(&self, envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
        let json = serde_json::to_vec(envelope).map_err(|e| ChannelError::Issue(e.to_string()))?;
        match self.compression_level {
            Some(level) => encode(&json, level).map_err(|e| ChannelError::Issue(e.to_string())),
            None => Ok(json),
        }
    }
}

fn encode(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl DeliveryChannel for HttpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&mut self, endpoint: &str, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.in_flight.is_some() {
            return Err(ChannelError::Issue(format!(
                "channel {} has not been reset since its last send",
                self.id
            )));
        }

        let body = self.body(envelope)?;
        let request = self.client.post(endpoint).headers(self.headers()).body(body);
        let id = self.id;
        let total = envelope.total;
        let endpoint = endpoint.to_string();

        self.in_flight = Some(tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(
                            "Channel {} delivered {} entries to {}: {}",
                            id, total, endpoint, status
                        );
                    } else {
                        warn!(
                            "Channel {} delivery of {} entries to {} answered {}",
                            id, total, endpoint, status
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "Channel {} failed to deliver {} entries to {}: {}",
                        id, total, endpoint, e
                    );
                }
            }
        }));
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ChannelError> {
        match self.in_flight.take() {
            Some(handle) => handle
                .await
                .map_err(|e| ChannelError::Reset(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpChannelFactory {
    request_timeout: Duration,
    compression_level: Option<i32>,
}

impl HttpChannelFactory {
    #[must_use]
    pub fn new(request_timeout: Duration, compression_level: Option<i32>) -> Self {
        HttpChannelFactory {
            request_timeout,
            compression_level,
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.request_timeout(), config.compression_level)
    }
}

impl ChannelFactory for HttpChannelFactory {
    fn build(&self, id: u64) -> Result<Box<dyn DeliveryChannel>, ChannelError> {
        Ok(Box::new(HttpChannel::new(
            id,
            self.request_timeout,
            self.compression_level,
        )?))
    }
}
