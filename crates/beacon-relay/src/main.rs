// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Reads JSON telemetry records from stdin and feeds them through a beacon
//! pipeline, dumping every category on a fixed interval and once more on exit.

mod config;
mod input;
mod logger;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use beacon::{
    config::PipelineConfig,
    dispatcher::DumpOptions,
    identity::IdentityFactory,
    service::{PipelineHandle, PipelineService},
};

use crate::config::RelayConfig;
use crate::input::InputRecord;

const FALLBACK_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let relay_config = RelayConfig::from_env();
    let log_level = relay_config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| FALLBACK_LOG_LEVEL.to_string());

    if let Err(e) = init_logging(&log_level) {
        eprintln!("BEACON | ERROR | Failed to set up logging: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let relay_config = match relay_config {
        Ok(c) => c,
        Err(e) => {
            error!("Error reading relay configuration: {e}");
            return;
        }
    };
    let pipeline_config = match PipelineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error reading pipeline configuration: {e}");
            return;
        }
    };

    let identity = relay_config.identity();
    let (service, handle) = match PipelineService::new(
        pipeline_config,
        IdentityFactory::new_from_static(identity.clone()),
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to start pipeline: {e}");
            return;
        }
    };
    let service_task = tokio::spawn(service.run());
    info!("Relaying stdin into pipeline for {}", identity.key());

    let cancel_token = CancellationToken::new();
    tokio::spawn(read_stdin(handle.clone(), cancel_token.clone()));

    let mut flush_interval = interval(relay_config.flush_interval);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = flush_interval.tick() => {
                dump(&handle).await;
            }
            () = cancel_token.cancelled() => {
                debug!("Input closed");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, flushing before exit");
                cancel_token.cancel();
                break;
            }
        }
    }

    dump(&handle).await;
    if let Err(e) = handle.shutdown().await {
        error!("Failed to shut down pipeline: {e}");
    }
    let stats = handle.pool_stats();
    drop(handle);
    if let Err(e) = service_task.await {
        error!("Pipeline service task failed: {e}");
    }
    info!(
        created = stats.created,
        lost = stats.lost,
        failed_builds = stats.failed_builds,
        "Relay stopped"
    );
}

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{log_level}"))?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(logger::Formatter::default())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn read_stdin(handle: PipelineHandle, cancel_token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            () = cancel_token.cancelled() => return,
        };
        match line {
            Ok(Some(line)) => match InputRecord::parse(&line) {
                Ok(Some(record)) => {
                    if let Err(e) = record.submit(&handle) {
                        error!("Failed to log record: {e}");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping malformed record: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        }
    }
    cancel_token.cancel();
}

async fn dump(handle: &PipelineHandle) {
    match handle.dump(DumpOptions::all()).await {
        Ok(summary) if summary.is_empty() => debug!("Nothing to dump"),
        Ok(summary) => debug!("Dumped {} entries", summary.total()),
        Err(e) => error!("Failed to dump pipeline: {e}"),
    }
}
