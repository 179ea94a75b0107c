//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Continuous writer loop for the R-Fleet daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use anyhow::Result;
use r_fleet_common::config::AppConfig;
use r_fleet_core::FleetEngine;
use r_fleet_metrics::{spawn_http_server, SharedRegistry};
use serde::Serialize;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochLimit,
    Signal,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub epochs_written: u64,
    pub failed_writes: u64,
    pub last_epoch: Option<i64>,
    pub stopped_by: StopReason,
}

/// Write one epoch per configured step until `limit` epochs are written or
/// ctrl-c arrives. A failed write is logged and retried on the next step.
pub async fn run_writer(
    engine: &FleetEngine,
    config: &AppConfig,
    registry: Option<SharedRegistry>,
    limit: Option<u64>,
) -> Result<RunSummary> {
    let metrics_server = match registry {
        Some(registry) => {
            let server = spawn_http_server(registry, config.metrics.listen)?;
            info!(address = %server.addr(), "metrics exporter enabled");
            Some(server)
        }
        None => {
            info!("metrics exporter disabled by configuration");
            None
        }
    };

    let status = engine.initialize().await?;
    info!(
        stream = %engine.settings().stream_id,
        epoch = status.epoch(),
        step_secs = engine.settings().step.as_secs(),
        "writer running; waiting for termination signal"
    );

    let mut ticker = interval(engine.settings().step);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut epochs_written = 0;
    let mut failed_writes = 0;
    let mut last_epoch = status.epoch();
    let stopped_by = loop {
        if limit.is_some_and(|limit| epochs_written >= limit) {
            break StopReason::EpochLimit;
        }
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("ctrl-c received; stopping writer");
                break StopReason::Signal;
            }
            _ = ticker.tick() => match engine.write_one_epoch().await {
                Ok(outcome) => {
                    epochs_written += 1;
                    last_epoch = Some(outcome.epoch);
                }
                Err(err) => {
                    failed_writes += 1;
                    warn!(error = %err, "epoch write failed; retrying next step");
                }
            },
        }
    };

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(RunSummary {
        epochs_written,
        failed_writes,
        last_epoch,
        stopped_by,
    })
}
