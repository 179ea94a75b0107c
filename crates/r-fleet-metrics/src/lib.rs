//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Metrics collection and export utilities."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
///
/// Binding port `0` picks an ephemeral port; [`MetricsServer::addr`] reports the
/// address actually bound.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new()
        .route(
            "/metrics",
            get({
                let registry = registry.clone();
                move || render_metrics(registry.clone())
            }),
        )
        .route("/healthz", get(|| async { "ok" }));

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn render_metrics(registry: SharedRegistry) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters and histograms describing the simulation engine.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: SharedRegistry,
    epoch: IntGauge,
    epochs_advanced: IntCounterVec,
    rows: IntCounterVec,
    refresh_outcomes: IntCounterVec,
    refresh_seconds: HistogramVec,
    cache_lookups: IntCounterVec,
    degraded_reads: IntCounterVec,
    resets: IntCounter,
}

impl fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("epoch", &self.epoch.get())
            .finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let epoch = IntGauge::with_opts(Opts::new(
            "r_fleet_stream_epoch",
            "Last committed epoch of the telemetry stream",
        ))?;
        registry.register(Box::new(epoch.clone()))?;

        let epochs_advanced = IntCounterVec::new(
            Opts::new(
                "r_fleet_epochs_advanced_total",
                "Epochs committed, labelled by the path that committed them",
            ),
            &["path"],
        )?;
        registry.register(Box::new(epochs_advanced.clone()))?;

        let rows = IntCounterVec::new(
            Opts::new(
                "r_fleet_rows_total",
                "Telemetry rows by source and outcome (inserted or skipped)",
            ),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(rows.clone()))?;

        let refresh_outcomes = IntCounterVec::new(
            Opts::new(
                "r_fleet_refresh_total",
                "Refresh triggers by trigger kind and resulting status",
            ),
            &["trigger", "status"],
        )?;
        registry.register(Box::new(refresh_outcomes.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let refresh_seconds = HistogramVec::new(
            HistogramOpts::new(
                "r_fleet_refresh_seconds",
                "Wall time spent executing a prediction cache refresh",
            )
            .buckets(buckets),
            &["trigger"],
        )?;
        registry.register(Box::new(refresh_seconds.clone()))?;

        let cache_lookups = IntCounterVec::new(
            Opts::new(
                "r_fleet_cache_lookups_total",
                "Read cache lookups by cache name and result",
            ),
            &["cache", "result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let degraded_reads = IntCounterVec::new(
            Opts::new(
                "r_fleet_degraded_reads_total",
                "Reads answered with an empty result because the store failed",
            ),
            &["view"],
        )?;
        registry.register(Box::new(degraded_reads.clone()))?;

        let resets = IntCounter::with_opts(Opts::new(
            "r_fleet_resets_total",
            "Number of full simulation resets",
        ))?;
        registry.register(Box::new(resets.clone()))?;

        Ok(Self {
            registry,
            epoch,
            epochs_advanced,
            rows,
            refresh_outcomes,
            refresh_seconds,
            cache_lookups,
            degraded_reads,
            resets,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_advance(&self, path: &str, epochs: u64, new_epoch: i64) {
        self.epochs_advanced.with_label_values(&[path]).inc_by(epochs);
        self.epoch.set(new_epoch);
    }

    pub fn record_rows(&self, source: &str, inserted: u64, skipped: u64) {
        self.rows
            .with_label_values(&[source, "inserted"])
            .inc_by(inserted);
        self.rows
            .with_label_values(&[source, "skipped"])
            .inc_by(skipped);
    }

    pub fn record_refresh(&self, trigger: &str, status: &str) {
        self.refresh_outcomes
            .with_label_values(&[trigger, status])
            .inc();
    }

    pub fn observe_refresh_duration(&self, trigger: &str, seconds: f64) {
        self.refresh_seconds
            .with_label_values(&[trigger])
            .observe(seconds);
    }

    pub fn record_cache(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[cache, result]).inc();
    }

    pub fn record_degraded_read(&self, view: &str) {
        self.degraded_reads.with_label_values(&[view]).inc();
    }

    pub fn record_reset(&self) {
        self.resets.inc();
        self.epoch.set(0);
    }
}

pub use prometheus;
