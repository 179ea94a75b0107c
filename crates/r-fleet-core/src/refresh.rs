//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Single-flight, throttled prediction cache refresh."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Prediction cache refresh.
//!
//! [`RefreshState`] is the only piece of engine state that needs true mutual
//! exclusion: the in-progress flag and the last start time live under one
//! lock so that checking and claiming a refresh is a single step.
//! [`RefreshCoordinator`] runs the recomputation behind that guard and
//! [`RefreshDispatcher`] feeds it from read paths without blocking them.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_fleet_common::time::{floor_to_minutes, to_delta, SharedClock};
use r_fleet_metrics::EngineMetrics;
use r_fleet_store::{
    FailureMarker, FailureMarkerStore, PredictionCacheStore, PredictionEntry, PredictionSource,
    RawPrediction, SharedStore, SourceError, StoreError,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ReadCaches;

/// Outcome of a refresh trigger. Contention is expected control flow, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Throttled,
    AlreadyInProgress,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Throttled => "throttled",
            RefreshStatus::AlreadyInProgress => "already_in_progress",
        }
    }
}

/// Who asked for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Manual,
    Auto,
}

impl RefreshTrigger {
    pub fn from_manual(manual: bool) -> Self {
        if manual {
            RefreshTrigger::Manual
        } else {
            RefreshTrigger::Auto
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RefreshTrigger::Manual => "manual",
            RefreshTrigger::Auto => "auto",
        }
    }
}

/// A failed recomputation step. Logged by the coordinator, never surfaced to
/// callers of [`RefreshCoordinator::trigger`].
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("prediction source failed: {0}")]
    Source(#[from] SourceError),
    #[error("prediction cache write failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct Flight {
    in_progress: bool,
    last_started: Option<DateTime<Utc>>,
}

/// Process-wide single-flight and cooldown guard.
#[derive(Clone)]
pub struct RefreshState {
    flight: Arc<Mutex<Flight>>,
    cooldown: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flight = self.flight.lock();
        f.debug_struct("RefreshState")
            .field("cooldown", &self.cooldown)
            .field("in_progress", &flight.in_progress)
            .field("last_started", &flight.last_started)
            .finish()
    }
}

impl RefreshState {
    pub fn new(cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            flight: Arc::new(Mutex::new(Flight::default())),
            cooldown,
            clock,
        }
    }

    /// Claim the refresh slot. Both rejections leave the state untouched.
    ///
    /// The in-progress check runs before the cooldown check. This reverses the
    /// cooldown-first order of the refresh procedure: a trigger racing a
    /// refresh started inside the cooldown reports `AlreadyInProgress` where a
    /// cooldown-first check would report `Throttled`.
    pub fn try_begin(&self) -> Result<RefreshGuard, RefreshStatus> {
        let now = self.clock.now();
        let mut flight = self.flight.lock();
        if flight.in_progress {
            return Err(RefreshStatus::AlreadyInProgress);
        }
        if let Some(last) = flight.last_started {
            if now - last < to_delta(self.cooldown) {
                return Err(RefreshStatus::Throttled);
            }
        }
        flight.in_progress = true;
        flight.last_started = Some(now);
        Ok(RefreshGuard {
            flight: Arc::clone(&self.flight),
        })
    }

    pub fn in_progress(&self) -> bool {
        self.flight.lock().in_progress
    }

    pub fn last_started(&self) -> Option<DateTime<Utc>> {
        self.flight.lock().last_started
    }
}

/// Held while a refresh runs; releases the slot on drop, including on panic
/// or cancellation of the owning future.
#[derive(Debug)]
pub struct RefreshGuard {
    flight: Arc<Mutex<Flight>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.flight.lock().in_progress = false;
    }
}

#[derive(Debug, Default)]
struct RecomputeSummary {
    predictions: usize,
    markers_added: usize,
    markers_removed: usize,
}

/// Recomputes the prediction cache and first-failure markers from the
/// upstream view.
pub struct RefreshCoordinator {
    state: RefreshState,
    store: SharedStore,
    source: Arc<dyn PredictionSource>,
    clock: SharedClock,
    caches: Arc<ReadCaches>,
    metrics: Option<EngineMetrics>,
    bucket_minutes: u32,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("state", &self.state)
            .field("bucket_minutes", &self.bucket_minutes)
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    pub fn new(
        state: RefreshState,
        store: SharedStore,
        source: Arc<dyn PredictionSource>,
        clock: SharedClock,
        caches: Arc<ReadCaches>,
        metrics: Option<EngineMetrics>,
        bucket_minutes: u32,
    ) -> Self {
        Self {
            state,
            store,
            source,
            clock,
            caches,
            metrics,
            bucket_minutes,
        }
    }

    pub fn state(&self) -> &RefreshState {
        &self.state
    }

    /// Run one refresh unless another is running or the cooldown has not
    /// elapsed. Recompute failures are logged and still report `Success`:
    /// the previous cache contents stay in place until the next refresh.
    pub async fn trigger(&self, trigger: RefreshTrigger) -> RefreshStatus {
        let guard = match self.state.try_begin() {
            Ok(guard) => guard,
            Err(status) => {
                debug!(
                    target: "r_fleet::refresh",
                    trigger = trigger.as_str(),
                    outcome = status.as_str(),
                    "refresh skipped"
                );
                self.record(trigger, status);
                return status;
            }
        };

        info!(target: "r_fleet::refresh", trigger = trigger.as_str(), "refresh started");
        let started = Instant::now();
        match self.recompute().await {
            Ok(summary) => info!(
                target: "r_fleet::refresh",
                trigger = trigger.as_str(),
                predictions = summary.predictions,
                markers_added = summary.markers_added,
                markers_removed = summary.markers_removed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "refresh finished"
            ),
            Err(err) => warn!(
                target: "r_fleet::refresh",
                trigger = trigger.as_str(),
                error = %err,
                "refresh failed; keeping previous predictions"
            ),
        }
        self.caches.invalidate_predictions();
        drop(guard);

        if let Some(metrics) = &self.metrics {
            metrics.observe_refresh_duration(trigger.as_str(), started.elapsed().as_secs_f64());
        }
        self.record(trigger, RefreshStatus::Success);
        RefreshStatus::Success
    }

    /// One store call per table, so a failure leaves later tables as they were.
    async fn recompute(&self) -> Result<RecomputeSummary, RefreshError> {
        let raw = self.source.latest_predictions().await?;
        let now = self.clock.now();
        let entries: Vec<PredictionEntry> = latest_per_entity(raw)
            .into_values()
            .map(|p| PredictionEntry {
                entity_id: p.entity_id,
                prediction_timestamp: p.prediction_timestamp,
                predicted_failure: p.predicted_failure,
                hours_to_failure: p.hours_to_failure,
                model: p.model,
                snapshot: p.snapshot,
                last_updated: now,
            })
            .collect();
        let mut summary = RecomputeSummary {
            predictions: self.store.upsert_predictions(entries).await?,
            ..RecomputeSummary::default()
        };

        let cached = self.store.list_predictions().await?;
        let mut failing = BTreeSet::new();
        let mut candidates = Vec::new();
        for entry in &cached {
            let Some(failure_type) = entry.predicted_failure.failure() else {
                continue;
            };
            failing.insert(entry.entity_id.clone());
            candidates.push(FailureMarker {
                entity_id: entry.entity_id.clone(),
                failure_type,
                first_failure_time: floor_to_minutes(
                    entry.prediction_timestamp,
                    self.bucket_minutes,
                ),
                recorded_at: now,
            });
        }
        summary.markers_added = self.store.insert_new_markers(candidates).await?;
        summary.markers_removed = self.store.retain_markers_for(&failing).await?;
        Ok(summary)
    }

    fn record(&self, trigger: RefreshTrigger, status: RefreshStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh(trigger.as_str(), status.as_str());
        }
    }
}

fn latest_per_entity(raw: Vec<RawPrediction>) -> BTreeMap<String, RawPrediction> {
    let mut latest: BTreeMap<String, RawPrediction> = BTreeMap::new();
    for prediction in raw {
        match latest.get(&prediction.entity_id) {
            Some(kept) if kept.prediction_timestamp >= prediction.prediction_timestamp => {}
            _ => {
                latest.insert(prediction.entity_id.clone(), prediction);
            }
        }
    }
    latest
}

/// Background worker that runs automatic refreshes off the request path.
///
/// The queue holds one pending request; further requests while one is
/// pending are coalesced into it.
#[derive(Debug)]
pub struct RefreshDispatcher {
    tx: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

impl RefreshDispatcher {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(coordinator: Arc<RefreshCoordinator>) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let worker = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let status = coordinator.trigger(RefreshTrigger::Auto).await;
                debug!(
                    target: "r_fleet::refresh",
                    outcome = status.as_str(),
                    "background refresh handled"
                );
            }
        });
        Self { tx, worker }
    }

    /// Queue an automatic refresh. Returns `false` when the request was
    /// coalesced into one already pending or the worker is gone.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!(target: "r_fleet::refresh", "refresh already queued; coalesced");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!(target: "r_fleet::refresh", "refresh worker stopped; request dropped");
                false
            }
        }
    }

    /// Stop accepting requests and wait for the worker to drain.
    pub async fn shutdown(self) {
        let Self { tx, worker } = self;
        drop(tx);
        if let Err(err) = worker.await {
            warn!(target: "r_fleet::refresh", error = %err, "refresh worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use r_fleet_common::ManualClock;
    use r_fleet_store::{FailureType, MemoryStore, PredictedFailure, Reading};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn reading() -> Reading {
        Reading {
            engine_temp: 95.0,
            trans_oil_pressure: 40.0,
            battery_voltage: 12.5,
        }
    }

    fn raw(entity: &str, minute: u32, predicted: PredictedFailure) -> RawPrediction {
        RawPrediction {
            entity_id: entity.to_owned(),
            prediction_timestamp: start() + chrono::TimeDelta::minutes(i64::from(minute)),
            predicted_failure: predicted,
            hours_to_failure: predicted.failure().map(|_| 12.0),
            model: Some("fixed".into()),
            snapshot: reading(),
        }
    }

    struct FixedSource(Mutex<Vec<RawPrediction>>);

    #[async_trait]
    impl PredictionSource for FixedSource {
        async fn latest_predictions(&self) -> Result<Vec<RawPrediction>, SourceError> {
            Ok(self.0.lock().clone())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        memory: Arc<MemoryStore>,
        source: Arc<FixedSource>,
        coordinator: RefreshCoordinator,
    }

    fn fixture(predictions: Vec<RawPrediction>) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let memory = Arc::new(MemoryStore::new());
        let source = Arc::new(FixedSource(Mutex::new(predictions)));
        let caches = Arc::new(ReadCaches::new(Duration::from_secs(3), clock.clone(), None));
        let coordinator = RefreshCoordinator::new(
            RefreshState::new(Duration::from_secs(15), clock.clone()),
            memory.clone(),
            source.clone(),
            clock.clone(),
            caches,
            None,
            5,
        );
        Fixture {
            clock,
            memory,
            source,
            coordinator,
        }
    }

    #[test]
    fn guard_release_reopens_slot_after_cooldown() {
        let clock = Arc::new(ManualClock::new(start()));
        let state = RefreshState::new(Duration::from_secs(15), clock.clone());

        let guard = state.try_begin().unwrap();
        assert!(state.in_progress());
        assert_eq!(state.try_begin().unwrap_err(), RefreshStatus::AlreadyInProgress);
        drop(guard);
        assert!(!state.in_progress());

        assert_eq!(state.try_begin().unwrap_err(), RefreshStatus::Throttled);
        assert_eq!(state.last_started(), Some(start()));
        clock.advance(Duration::from_secs(15));
        assert!(state.try_begin().is_ok());
    }

    #[test]
    fn keeps_newest_prediction_per_entity() {
        let latest = latest_per_entity(vec![
            raw("T1", 10, PredictedFailure::Engine),
            raw("T1", 20, PredictedFailure::Normal),
            raw("T1", 5, PredictedFailure::Electrical),
            raw("T2", 1, PredictedFailure::Normal),
        ]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["T1"].predicted_failure, PredictedFailure::Normal);
    }

    #[tokio::test]
    async fn second_trigger_within_cooldown_is_throttled() {
        let fx = fixture(vec![raw("T1", 0, PredictedFailure::Normal)]);
        assert_eq!(fx.coordinator.trigger(RefreshTrigger::Manual).await, RefreshStatus::Success);
        let first = fx.memory.list_predictions().await.unwrap();

        fx.clock.advance(Duration::from_secs(10));
        *fx.source.0.lock() = vec![raw("T1", 30, PredictedFailure::Engine)];
        assert_eq!(fx.coordinator.trigger(RefreshTrigger::Manual).await, RefreshStatus::Throttled);
        assert_eq!(fx.memory.list_predictions().await.unwrap(), first);
    }

    #[tokio::test]
    async fn markers_are_recorded_once_and_pruned_on_recovery() {
        let fx = fixture(vec![
            raw("T1", 7, PredictedFailure::Engine),
            raw("T2", 0, PredictedFailure::Normal),
        ]);
        fx.coordinator.trigger(RefreshTrigger::Manual).await;
        let markers = fx.memory.list_markers().await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].failure_type, FailureType::Engine);
        // Floored onto the five minute chart grid.
        assert_eq!(markers[0].first_failure_time, start() + chrono::TimeDelta::minutes(5));

        fx.clock.advance(Duration::from_secs(20));
        *fx.source.0.lock() = vec![raw("T1", 42, PredictedFailure::Engine)];
        fx.coordinator.trigger(RefreshTrigger::Auto).await;
        assert_eq!(fx.memory.list_markers().await.unwrap(), markers);

        fx.clock.advance(Duration::from_secs(20));
        *fx.source.0.lock() = vec![raw("T1", 50, PredictedFailure::Normal)];
        fx.coordinator.trigger(RefreshTrigger::Auto).await;
        assert!(fx.memory.list_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_recompute_still_releases_slot() {
        let fx = fixture(vec![raw("T1", 0, PredictedFailure::Engine)]);
        fx.memory.set_available(false);

        assert_eq!(fx.coordinator.trigger(RefreshTrigger::Manual).await, RefreshStatus::Success);
        assert!(!fx.coordinator.state().in_progress());

        fx.memory.set_available(true);
        fx.clock.advance(Duration::from_secs(15));
        fx.coordinator.trigger(RefreshTrigger::Manual).await;
        assert_eq!(fx.memory.list_predictions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatcher_runs_queued_refresh() {
        let fx = fixture(vec![raw("T3", 0, PredictedFailure::Transmission)]);
        let memory = fx.memory.clone();
        let dispatcher = RefreshDispatcher::spawn(Arc::new(fx.coordinator));

        assert!(dispatcher.request());
        dispatcher.shutdown().await;
        assert_eq!(memory.list_predictions().await.unwrap().len(), 1);
    }
}
