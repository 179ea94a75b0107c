//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the R-Fleet daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_fleet_common::config::AppConfig;
use r_fleet_common::logging::init_tracing;
use r_fleet_common::time::SystemClock;
use r_fleet_core::{EngineSettings, FleetEngine};
use r_fleet_metrics::{new_registry, EngineMetrics, SharedRegistry};
use r_fleet_sim::{SeedCatalog, ThresholdView, Thresholds};
use r_fleet_store::{MemoryStore, SharedStore};
use serde::Serialize;
use serde_json::json;
use tracing::info;

mod run;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "R-Fleet telemetry simulation daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the stream clock if it does not exist")]
    Init,
    #[command(about = "Write exactly one epoch")]
    WriteEpoch,
    #[command(about = "Advance the stream by whole hours of simulated time")]
    FastForward {
        #[arg(allow_negative_numbers = true, value_name = "HOURS")]
        hours: i64,
    },
    #[command(about = "Inject a failure into one entity from the next epoch on")]
    Activate {
        entity: String,
        #[arg(value_name = "TYPE", help = "engine, transmission or electrical")]
        failure_type: String,
    },
    #[command(about = "Remove every failure configuration")]
    ClearFailures,
    #[command(about = "List active failures")]
    Failures,
    #[command(about = "Show the writer clock")]
    Status,
    #[command(about = "Recompute the prediction cache now")]
    Refresh,
    #[command(about = "Truncate all tables and restart at epoch zero")]
    Reset,
    #[command(about = "Latest reading and online status per entity")]
    Telemetry,
    #[command(about = "Cached predictions with staleness")]
    Predictions,
    #[command(about = "First-failure markers")]
    Markers,
    #[command(about = "Bucketed averages over the last hours of telemetry")]
    Chart {
        #[arg(default_value_t = 1)]
        hours: u32,
    },
    #[command(about = "Combined telemetry, prediction and failure read")]
    Dashboard {
        #[arg(long, help = "Include chart data and markers")]
        charts: bool,
        #[arg(long, default_value_t = 1)]
        hours: u32,
    },
    #[command(about = "Every row at the newest timestamp")]
    Frame,
    #[command(about = "Write one epoch per step until interrupted")]
    Run {
        #[arg(long, help = "Stop after this many epochs")]
        epochs: Option<u64>,
    },
}

impl Commands {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Commands::Init
                | Commands::WriteEpoch
                | Commands::FastForward { .. }
                | Commands::Activate { .. }
                | Commands::ClearFailures
                | Commands::Refresh
                | Commands::Reset
                | Commands::Run { .. }
                // Stale predictions queue a background refresh.
                | Commands::Predictions
                | Commands::Dashboard { .. }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/fleet.toml"));
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("r-fleetd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    let memory = Arc::new(open_store(&config)?);
    let catalog = Arc::new(SeedCatalog::from_config(&config.seeds).context("loading seed catalog")?);
    info!(
        entities = catalog.entity_count(),
        policy = ?catalog.policy(),
        "seed catalog ready"
    );

    let registry = config.metrics.enabled.then(new_registry);
    let metrics = registry
        .clone()
        .map(EngineMetrics::new)
        .transpose()
        .context("registering engine metrics")?;

    let store: SharedStore = memory.clone();
    let source = Arc::new(ThresholdView::new(store.clone(), Thresholds::default()));
    let engine = FleetEngine::new(
        EngineSettings::from_config(&config),
        store,
        catalog,
        source,
        Arc::new(SystemClock),
        metrics,
    );

    let mutates = cli.command.mutates();
    let outcome = execute(&engine, cli.command, &config, registry).await;
    engine.shutdown().await;
    outcome?;

    if mutates {
        if let Some(path) = &config.store.snapshot_path {
            memory
                .save_snapshot(path)
                .with_context(|| format!("saving store snapshot to {}", path.display()))?;
            info!(path = %path.display(), "store snapshot saved");
        }
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<MemoryStore> {
    match &config.store.snapshot_path {
        Some(path) if path.exists() => {
            let store = MemoryStore::load_snapshot(path)
                .with_context(|| format!("loading store snapshot {}", path.display()))?;
            info!(path = %path.display(), "store restored from snapshot");
            Ok(store)
        }
        _ => Ok(MemoryStore::new()),
    }
}

async fn execute(
    engine: &FleetEngine,
    command: Commands,
    config: &AppConfig,
    registry: Option<SharedRegistry>,
) -> Result<()> {
    match command {
        Commands::Init => emit(&engine.initialize().await?),
        Commands::WriteEpoch => emit(&engine.write_one_epoch().await?),
        Commands::FastForward { hours } => emit(&engine.fast_forward(hours).await?),
        Commands::Activate {
            entity,
            failure_type,
        } => emit(&engine.activate_failure(&entity, &failure_type).await?),
        Commands::ClearFailures => {
            let removed = engine.clear_all_failures().await?;
            emit(&json!({ "removed": removed }))
        }
        Commands::Failures => emit(&engine.get_active_failures().await),
        Commands::Status => emit(&engine.get_writer_status().await?),
        Commands::Refresh => {
            let status = engine.trigger_refresh(true).await;
            emit(&json!({ "status": status }))
        }
        Commands::Reset => emit(&engine.reset_all().await?),
        Commands::Telemetry => emit(&engine.telemetry_latest().await),
        Commands::Predictions => emit(&engine.predictions().await),
        Commands::Markers => emit(&engine.markers().await),
        Commands::Chart { hours } => emit(&engine.chart(hours).await),
        Commands::Dashboard { charts, hours } => emit(&engine.dashboard(charts, hours).await),
        Commands::Frame => emit(&engine.latest_frame().await),
        Commands::Run { epochs } => {
            let summary = run::run_writer(engine, config, registry, epochs).await?;
            emit(&summary)
        }
    }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
