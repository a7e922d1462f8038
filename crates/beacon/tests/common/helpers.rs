// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use beacon::channel::ChannelFactory;
use beacon::clock::{ManualClock, NavigationState};
use beacon::config::{CategoryConfig, DumpMethod, PipelineConfig};
use beacon::dispatcher::InspectSink;
use beacon::entry::Category;
use beacon::events::DeliveryEvent;
use beacon::identity::{Identity, IdentityFactory};
use beacon::service::{PipelineHandle, PipelineService};
use beacon::store::RecoveryStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const USER_ID: &str = "2333333";
pub const OPERATOR_ID: &str = "42";
pub const IDENTITY_KEY: &str = "2333333-42";

pub struct TestPipeline {
    pub handle: PipelineHandle,
    pub task: JoinHandle<()>,
}

impl TestPipeline {
    /// Shut the service down and wait for its task, as a page unload would.
    pub async fn stop(self) {
        self.handle.shutdown().await.expect("shutdown should succeed");
        self.task.await.expect("service task should not panic");
    }
}

/// Configuration with a uniform threshold and default method for every
/// category.
pub fn uniform_config(threshold: usize, method: DumpMethod) -> PipelineConfig {
    let mut config = PipelineConfig {
        threshold,
        default_method: method,
        ..Default::default()
    };
    for category in Category::ALL {
        config.categories.insert(
            category,
            CategoryConfig {
                threshold: Some(threshold),
                default_method: None,
            },
        );
    }
    config
}

pub fn start_pipeline(
    config: PipelineConfig,
    store: Arc<dyn RecoveryStore>,
    sink: Arc<dyn InspectSink>,
    factory: Arc<dyn ChannelFactory>,
) -> TestPipeline {
    let (service, handle) = PipelineService::builder(config)
        .identity(IdentityFactory::new_from_static(Identity::new(
            USER_ID,
            OPERATOR_ID,
        )))
        .store(store)
        .inspect_sink(sink)
        .channel_factory(factory)
        .clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .paths(Arc::new(NavigationState::new("/campaigns")))
        .build()
        .expect("pipeline should build");
    TestPipeline {
        handle,
        task: tokio::spawn(service.run()),
    }
}

/// Next delivery event, failing the test if none arrives in time.
pub async fn next_event(events: &mut broadcast::Receiver<DeliveryEvent>) -> DeliveryEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a delivery event")
        .expect("event bus closed")
}
