//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Primary orchestration and lifecycle management."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use r_fleet_common::time::SharedClock;
use r_fleet_common::AppConfig;
use r_fleet_metrics::EngineMetrics;
use r_fleet_sim::{
    ActiveFailure, BulkAdvancer, BulkOutcome, EpochOutcome, EpochWriter, FailureRegistry,
    SeedCatalog, StreamClock,
};
use r_fleet_store::{
    BucketAverage, CommitReport, EpochCommitter, FailureConfig, FailureMarker,
    FailureMarkerStore, PredictionCacheStore, PredictionSource, SharedStore, TelemetryStore,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::cache::ReadCaches;
use crate::reads::{Dashboard, LatestFrame, PredictionView, TelemetryStatus, WriterStatus};
use crate::refresh::{
    RefreshCoordinator, RefreshDispatcher, RefreshState, RefreshStatus, RefreshTrigger,
};
use crate::{EngineError, Result};

/// Engine tunables, flattened out of [`AppConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub stream_id: String,
    pub step: Duration,
    pub max_fast_forward_epochs: i64,
    pub refresh_cooldown: Duration,
    pub stale_after_minutes: i64,
    pub fast_forward_trigger_hours: i64,
    pub cache_ttl: Duration,
    pub online_window: Duration,
    pub chart_bucket_minutes: u32,
    pub chart_row_limit: usize,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream_id: config.stream.stream_id.clone(),
            step: config.stream.step,
            max_fast_forward_epochs: config.stream.max_fast_forward_epochs,
            refresh_cooldown: config.refresh.cooldown,
            stale_after_minutes: config.refresh.stale_after_minutes,
            fast_forward_trigger_hours: i64::try_from(config.refresh.fast_forward_trigger_hours)
                .unwrap_or(i64::MAX),
            cache_ttl: config.cache.ttl,
            online_window: config.reads.online_window,
            chart_bucket_minutes: config.reads.chart_bucket_minutes,
            chart_row_limit: config.reads.chart_row_limit,
        }
    }

    /// Whole epochs covered by `hours` of simulated time.
    pub fn epochs_for_hours(&self, hours: i64) -> Result<i64> {
        let step = i64::try_from(self.step.as_secs()).unwrap_or(i64::MAX);
        if hours <= 0 || step == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "fast-forward needs a positive duration (got {hours}h at {step}s per epoch)"
            )));
        }
        let epochs = hours
            .checked_mul(3600)
            .map(|secs| secs / step)
            .ok_or_else(|| EngineError::InvalidArgument(format!("{hours}h is out of range")))?;
        if epochs == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "{hours}h is shorter than one {step}s epoch"
            )));
        }
        Ok(epochs)
    }

    /// Reject spans larger than one bulk advance may stage.
    pub fn check_fast_forward_span(&self, epochs: i64) -> Result<()> {
        if epochs > self.max_fast_forward_epochs {
            return Err(EngineError::InvalidArgument(format!(
                "fast-forward of {epochs} epochs exceeds the limit of {}",
                self.max_fast_forward_epochs
            )));
        }
        Ok(())
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Facade the request layer talks to.
///
/// Clock advances, failure changes and resets are serialised through one
/// async lock so no two of them ever stage against the same epoch. Reads go
/// through the TTL caches and degrade to empty results when the store fails.
/// Construction spawns the background refresh worker, so it must happen
/// inside a tokio runtime.
pub struct FleetEngine {
    settings: EngineSettings,
    store: SharedStore,
    catalog: Arc<SeedCatalog>,
    stream: StreamClock,
    writer: EpochWriter,
    bulk: BulkAdvancer,
    registry: FailureRegistry,
    clock: SharedClock,
    caches: Arc<ReadCaches>,
    refresh: Arc<RefreshCoordinator>,
    dispatcher: RefreshDispatcher,
    advance_lock: AsyncMutex<()>,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for FleetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetEngine")
            .field("settings", &self.settings)
            .field("entities", &self.catalog.entity_count())
            .finish_non_exhaustive()
    }
}

impl FleetEngine {
    pub fn new(
        settings: EngineSettings,
        store: SharedStore,
        catalog: Arc<SeedCatalog>,
        source: Arc<dyn PredictionSource>,
        clock: SharedClock,
        metrics: Option<EngineMetrics>,
    ) -> Self {
        let stream = StreamClock::new(store.clone(), settings.stream_id.clone(), settings.step);
        let caches = Arc::new(ReadCaches::new(
            settings.cache_ttl,
            clock.clone(),
            metrics.clone(),
        ));
        let refresh = Arc::new(RefreshCoordinator::new(
            RefreshState::new(settings.refresh_cooldown, clock.clone()),
            store.clone(),
            source,
            clock.clone(),
            caches.clone(),
            metrics.clone(),
            settings.chart_bucket_minutes,
        ));
        let dispatcher = RefreshDispatcher::spawn(refresh.clone());

        Self {
            writer: EpochWriter::new(store.clone(), catalog.clone(), stream.clone()),
            bulk: BulkAdvancer::new(store.clone(), catalog.clone(), stream.clone()),
            registry: FailureRegistry::new(store.clone(), catalog.clone(), stream.clone()),
            settings,
            store,
            catalog,
            stream,
            clock,
            caches,
            refresh,
            dispatcher,
            advance_lock: AsyncMutex::new(()),
            metrics,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &SeedCatalog {
        &self.catalog
    }

    pub fn caches(&self) -> &ReadCaches {
        &self.caches
    }

    pub fn refresh_state(&self) -> &RefreshState {
        self.refresh.state()
    }

    /// Create the stream clock if it does not exist yet.
    pub async fn initialize(&self) -> Result<WriterStatus> {
        let _advance = self.advance_lock.lock().await;
        let clock = self.stream.initialize(self.clock.now()).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_advance("init", 0, clock.next_epoch);
        }
        Ok(WriterStatus::from_clock(&self.settings.stream_id, Some(clock)))
    }

    pub async fn write_one_epoch(&self) -> Result<EpochOutcome> {
        let outcome = {
            let _advance = self.advance_lock.lock().await;
            self.writer.write_one_epoch().await?
        };
        self.after_advance("single", 1, &outcome.report);
        Ok(outcome)
    }

    /// Advance by `hours` of simulated time. Jumps of at least the configured
    /// trigger size queue a background prediction refresh.
    pub async fn fast_forward(&self, hours: i64) -> Result<BulkOutcome> {
        let epochs = self.settings.epochs_for_hours(hours)?;
        let outcome = self.fast_forward_epochs(epochs).await?;
        if hours >= self.settings.fast_forward_trigger_hours {
            self.dispatcher.request();
        }
        Ok(outcome)
    }

    pub async fn fast_forward_epochs(&self, epochs: i64) -> Result<BulkOutcome> {
        self.settings.check_fast_forward_span(epochs)?;
        let outcome = {
            let _advance = self.advance_lock.lock().await;
            self.bulk.advance(epochs).await?
        };
        self.after_advance("bulk", outcome.epochs, &outcome.report);
        Ok(outcome)
    }

    pub async fn activate_failure(&self, entity_id: &str, failure_type: &str) -> Result<FailureConfig> {
        let config = {
            let _advance = self.advance_lock.lock().await;
            self.registry.activate_named(entity_id, failure_type).await?
        };
        self.caches.invalidate_failures();
        Ok(config)
    }

    pub async fn clear_all_failures(&self) -> Result<usize> {
        let removed = {
            let _advance = self.advance_lock.lock().await;
            self.registry.clear_all().await?
        };
        self.caches.invalidate_failures();
        Ok(removed)
    }

    pub async fn get_active_failures(&self) -> Vec<ActiveFailure> {
        let result = self
            .caches
            .failures
            .get_or_compute((), move || self.load_failures())
            .await;
        self.degrade("failures", result)
    }

    pub async fn trigger_refresh(&self, manual: bool) -> RefreshStatus {
        self.refresh.trigger(RefreshTrigger::from_manual(manual)).await
    }

    /// Queue a background refresh without waiting for it.
    pub fn request_refresh(&self) -> bool {
        self.dispatcher.request()
    }

    /// Truncate every table and restart the stream at epoch zero.
    pub async fn reset_all(&self) -> Result<WriterStatus> {
        let clock = self.stream.fresh(self.clock.now());
        {
            let _advance = self.advance_lock.lock().await;
            self.store.reset_all(clock.clone()).await?;
        }
        self.caches.invalidate_all();
        if let Some(metrics) = &self.metrics {
            metrics.record_reset();
            metrics.record_advance("reset", 0, 0);
        }
        info!(target: "r_fleet::engine", stream = %clock.stream_id, "stream reset");
        Ok(WriterStatus::from_clock(&self.settings.stream_id, Some(clock)))
    }

    pub async fn get_writer_status(&self) -> Result<WriterStatus> {
        let clock = self.stream.try_read().await?;
        Ok(WriterStatus::from_clock(&self.settings.stream_id, clock))
    }

    pub async fn telemetry_latest(&self) -> Vec<TelemetryStatus> {
        let result = self
            .caches
            .telemetry
            .get_or_compute((), move || self.load_telemetry())
            .await;
        self.degrade("telemetry", result)
    }

    /// Cached predictions. When the stalest one lags the telemetry by at
    /// least `stale_after_minutes`, a background refresh is queued; the read
    /// itself never waits on it.
    pub async fn predictions(&self) -> Vec<PredictionView> {
        let result = self
            .caches
            .predictions
            .get_or_compute((), move || self.load_predictions())
            .await;
        let views = self.degrade("predictions", result);
        if let Some(age) = PredictionView::max_age(&views) {
            if age >= self.settings.stale_after_minutes {
                info!(
                    target: "r_fleet::engine",
                    max_age_minutes = age,
                    "predictions stale; requesting refresh"
                );
                self.dispatcher.request();
            }
        }
        views
    }

    pub async fn markers(&self) -> Vec<FailureMarker> {
        let result = self
            .caches
            .markers
            .get_or_compute((), move || async move {
                Ok::<_, EngineError>(self.store.list_markers().await?)
            })
            .await;
        self.degrade("markers", result)
    }

    /// Bucketed averages over the `hours` before the newest telemetry.
    pub async fn chart(&self, hours: u32) -> Vec<BucketAverage> {
        let result = self
            .caches
            .chart
            .get_or_compute(hours, move || self.load_chart(hours))
            .await;
        self.degrade("chart", result)
    }

    pub async fn dashboard(&self, include_charts: bool, hours: u32) -> Dashboard {
        let (chart_data, markers) = if include_charts {
            (Some(self.chart(hours).await), Some(self.markers().await))
        } else {
            (None, None)
        };
        Dashboard {
            telemetry: self.telemetry_latest().await,
            predictions: self.predictions().await,
            failures: self.get_active_failures().await,
            chart_data,
            markers,
        }
    }

    /// Every row at the newest timestamp; uncached.
    pub async fn latest_frame(&self) -> LatestFrame {
        let result = self.load_frame().await;
        self.degrade("frame", result)
    }

    /// Stop the background refresh worker.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }

    fn after_advance(&self, path: &'static str, epochs: i64, report: &CommitReport) {
        self.caches.invalidate_telemetry();
        self.caches.invalidate_failures();
        if let Some(metrics) = &self.metrics {
            metrics.record_advance(path, u64::try_from(epochs).unwrap_or(0), report.next_epoch);
            metrics.record_rows(
                "normal",
                report.inserted_normal as u64,
                report.skipped_normal as u64,
            );
            metrics.record_rows(
                "failure",
                report.inserted_failure as u64,
                report.skipped_failure as u64,
            );
        }
    }

    fn degrade<T: Default>(&self, view: &'static str, result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target: "r_fleet::engine",
                    view,
                    error = %err,
                    "read degraded to empty result"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_degraded_read(view);
                }
                T::default()
            }
        }
    }

    async fn load_telemetry(&self) -> Result<Vec<TelemetryStatus>> {
        let latest = self.store.latest_per_entity().await?;
        Ok(TelemetryStatus::collect(
            self.catalog.entities(),
            latest,
            self.settings.online_window,
        ))
    }

    async fn load_predictions(&self) -> Result<Vec<PredictionView>> {
        let entries = self.store.list_predictions().await?;
        let latest = self.store.latest_timestamp().await?;
        Ok(PredictionView::collect(entries, latest))
    }

    async fn load_failures(&self) -> Result<Vec<ActiveFailure>> {
        Ok(self.registry.describe_active().await?)
    }

    async fn load_chart(&self, hours: u32) -> Result<Vec<BucketAverage>> {
        let Some(latest) = self.store.latest_timestamp().await? else {
            return Ok(Vec::new());
        };
        let from = latest - TimeDelta::hours(i64::from(hours));
        Ok(self
            .store
            .bucket_averages(from, self.settings.chart_bucket_minutes, self.settings.chart_row_limit)
            .await?)
    }

    async fn load_frame(&self) -> Result<LatestFrame> {
        let Some(timestamp) = self.store.latest_timestamp().await? else {
            return Ok(LatestFrame::default());
        };
        Ok(LatestFrame {
            timestamp: Some(timestamp),
            rows: self.store.rows_at(timestamp).await?,
        })
    }
}
