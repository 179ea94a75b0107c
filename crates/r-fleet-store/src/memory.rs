//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dao::{
    EpochCommitter, FailureConfigStore, FailureMarkerStore, PredictionCacheStore,
    StreamClockStore, TelemetryStore,
};
use crate::model::{
    AdvanceBatch, BucketAverage, ClockState, CommitReport, FailureConfig, FailureMarker,
    FailureType, InsertReport, PredictionEntry, Reading, RowSource, TelemetryRow,
};
use crate::snapshot::{self, StoreSnapshot};
use crate::{Result, StoreError};

/// Operations that can be made to fail once, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// [`EpochCommitter::commit_advance`].
    CommitAdvance,
    /// [`TelemetryStore::insert_rows`].
    InsertRows,
    /// [`FailureConfigStore::activate_failure`].
    ActivateFailure,
    /// [`PredictionCacheStore::upsert_predictions`].
    UpsertPredictions,
    /// [`FailureMarkerStore::insert_new_markers`].
    InsertMarkers,
    /// [`FailureMarkerStore::retain_markers_for`].
    RetainMarkers,
}

type RowKey = (DateTime<Utc>, String);

#[derive(Debug, Default)]
struct Tables {
    clocks: BTreeMap<String, ClockState>,
    failures: BTreeMap<String, FailureConfig>,
    telemetry: BTreeMap<RowKey, Reading>,
    predictions: BTreeMap<String, PredictionEntry>,
    markers: BTreeMap<(String, FailureType), FailureMarker>,
}

impl Tables {
    fn insert_row(&mut self, row: TelemetryRow) -> bool {
        let key = (row.timestamp, row.entity_id);
        if self.telemetry.contains_key(&key) {
            return false;
        }
        self.telemetry.insert(key, row.reading);
        true
    }
}

fn to_row(key: &RowKey, reading: &Reading) -> TelemetryRow {
    TelemetryRow {
        timestamp: key.0,
        entity_id: key.1.clone(),
        reading: *reading,
    }
}

/// In-process store. Every method holds one lock for its whole duration, so
/// each call is a transaction.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
    faults: Mutex<HashSet<FaultPoint>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty, reachable store.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Toggle reachability. While unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next call of `point` fail with [`StoreError::Unavailable`].
    pub fn arm_fault(&self, point: FaultPoint) {
        self.faults.lock().insert(point);
    }

    fn check(&self, point: Option<FaultPoint>) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        if let Some(point) = point {
            if self.faults.lock().remove(&point) {
                return Err(StoreError::Unavailable(format!("injected fault at {point:?}")));
            }
        }
        Ok(())
    }

    /// Copy out every table.
    pub fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.lock();
        StoreSnapshot {
            clocks: tables.clocks.values().cloned().collect(),
            failures: tables.failures.values().cloned().collect(),
            telemetry: tables
                .telemetry
                .iter()
                .map(|(key, reading)| to_row(key, reading))
                .collect(),
            predictions: tables.predictions.values().cloned().collect(),
            markers: tables.markers.values().cloned().collect(),
        }
    }

    /// Build a store holding `state`.
    pub fn from_snapshot(state: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.lock();
            for clock in state.clocks {
                tables.clocks.insert(clock.stream_id.clone(), clock);
            }
            for config in state.failures {
                tables.failures.insert(config.entity_id.clone(), config);
            }
            for row in state.telemetry {
                tables.insert_row(row);
            }
            for entry in state.predictions {
                tables.predictions.insert(entry.entity_id.clone(), entry);
            }
            for marker in state.markers {
                tables
                    .markers
                    .insert((marker.entity_id.clone(), marker.failure_type), marker);
            }
        }
        store
    }

    /// Persist every table to `path`.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        snapshot::save_snapshot(&self.snapshot(), path)
    }

    /// Restore a store from a verified snapshot.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        snapshot::load_snapshot(path).map(Self::from_snapshot)
    }
}

#[async_trait]
impl StreamClockStore for MemoryStore {
    async fn load_clock(&self, stream_id: &str) -> Result<Option<ClockState>> {
        self.check(None)?;
        Ok(self.tables.lock().clocks.get(stream_id).cloned())
    }

    async fn create_clock_if_missing(&self, clock: ClockState) -> Result<ClockState> {
        self.check(None)?;
        let mut tables = self.tables.lock();
        Ok(tables
            .clocks
            .entry(clock.stream_id.clone())
            .or_insert(clock)
            .clone())
    }

    async fn put_clock(&self, clock: ClockState) -> Result<()> {
        self.check(None)?;
        self.tables
            .lock()
            .clocks
            .insert(clock.stream_id.clone(), clock);
        Ok(())
    }

    async fn advance_clock(&self, stream_id: &str, by: i64) -> Result<i64> {
        self.check(None)?;
        let mut tables = self.tables.lock();
        let clock = tables
            .clocks
            .get_mut(stream_id)
            .ok_or_else(|| StoreError::NotInitialized(stream_id.to_owned()))?;
        clock.next_epoch += by;
        Ok(clock.next_epoch)
    }
}

#[async_trait]
impl FailureConfigStore for MemoryStore {
    async fn list_failures(&self) -> Result<Vec<FailureConfig>> {
        self.check(None)?;
        Ok(self.tables.lock().failures.values().cloned().collect())
    }

    async fn activate_failure(
        &self,
        entity_id: &str,
        failure_type: FailureType,
        effective_from_epoch: i64,
    ) -> Result<FailureConfig> {
        self.check(Some(FaultPoint::ActivateFailure))?;
        let mut tables = self.tables.lock();
        let config = tables
            .failures
            .entry(entity_id.to_owned())
            .and_modify(|existing| {
                existing.enabled = true;
                existing.failure_type = failure_type;
                existing.effective_from_epoch = effective_from_epoch;
            })
            .or_insert_with(|| FailureConfig {
                entity_id: entity_id.to_owned(),
                enabled: true,
                failure_type,
                failure_cursor: 0,
                effective_from_epoch,
            });
        Ok(config.clone())
    }

    async fn clear_failures(&self) -> Result<usize> {
        self.check(None)?;
        let mut tables = self.tables.lock();
        let removed = tables.failures.len();
        tables.failures.clear();
        Ok(removed)
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_rows(&self, rows: Vec<TelemetryRow>) -> Result<InsertReport> {
        self.check(Some(FaultPoint::InsertRows))?;
        let mut tables = self.tables.lock();
        let mut report = InsertReport::default();
        for row in rows {
            if tables.insert_row(row) {
                report.inserted += 1;
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }

    async fn rows_for_entity(&self, entity_id: &str) -> Result<Vec<TelemetryRow>> {
        self.check(None)?;
        let tables = self.tables.lock();
        Ok(tables
            .telemetry
            .iter()
            .filter(|(key, _)| key.1 == entity_id)
            .map(|(key, reading)| to_row(key, reading))
            .collect())
    }

    async fn rows_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRow>> {
        self.check(None)?;
        let tables = self.tables.lock();
        Ok(tables
            .telemetry
            .range((from, String::new())..)
            .take_while(|(key, _)| key.0 <= to)
            .map(|(key, reading)| to_row(key, reading))
            .collect())
    }

    async fn rows_at(&self, at: DateTime<Utc>) -> Result<Vec<TelemetryRow>> {
        self.check(None)?;
        let tables = self.tables.lock();
        Ok(tables
            .telemetry
            .range((at, String::new())..)
            .take_while(|(key, _)| key.0 == at)
            .map(|(key, reading)| to_row(key, reading))
            .collect())
    }

    async fn latest_per_entity(&self) -> Result<Vec<TelemetryRow>> {
        self.check(None)?;
        let tables = self.tables.lock();
        let mut latest: BTreeMap<&str, (&RowKey, &Reading)> = BTreeMap::new();
        // Keys ascend by time, so the last write per entity wins.
        for (key, reading) in &tables.telemetry {
            latest.insert(key.1.as_str(), (key, reading));
        }
        Ok(latest
            .into_values()
            .map(|(key, reading)| to_row(key, reading))
            .collect())
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.check(None)?;
        Ok(self
            .tables
            .lock()
            .telemetry
            .keys()
            .next_back()
            .map(|key| key.0))
    }

    async fn bucket_averages(
        &self,
        from: DateTime<Utc>,
        bucket_minutes: u32,
        limit: usize,
    ) -> Result<Vec<BucketAverage>> {
        self.check(None)?;
        let width = TimeDelta::minutes(i64::from(bucket_minutes.max(1)));
        let tables = self.tables.lock();

        let mut sums: BTreeMap<(DateTime<Utc>, &str), (Reading, usize)> = BTreeMap::new();
        for (key, reading) in tables.telemetry.range((from, String::new())..) {
            let start = key.0.duration_trunc(width).unwrap_or(key.0);
            let end = start + width;
            let slot = sums.entry((end, key.1.as_str())).or_insert((
                Reading {
                    engine_temp: 0.0,
                    trans_oil_pressure: 0.0,
                    battery_voltage: 0.0,
                },
                0,
            ));
            slot.0.engine_temp += reading.engine_temp;
            slot.0.trans_oil_pressure += reading.trans_oil_pressure;
            slot.0.battery_voltage += reading.battery_voltage;
            slot.1 += 1;
        }

        Ok(sums
            .into_iter()
            .take(limit)
            .map(|((bucket_end, entity_id), (sum, samples))| {
                let n = samples as f64;
                BucketAverage {
                    bucket_end,
                    entity_id: entity_id.to_owned(),
                    reading: Reading {
                        engine_temp: sum.engine_temp / n,
                        trans_oil_pressure: sum.trans_oil_pressure / n,
                        battery_voltage: sum.battery_voltage / n,
                    },
                    samples,
                }
            })
            .collect())
    }

    async fn count_rows(&self) -> Result<usize> {
        self.check(None)?;
        Ok(self.tables.lock().telemetry.len())
    }
}

#[async_trait]
impl PredictionCacheStore for MemoryStore {
    async fn upsert_predictions(&self, entries: Vec<PredictionEntry>) -> Result<usize> {
        self.check(Some(FaultPoint::UpsertPredictions))?;
        let mut tables = self.tables.lock();
        let count = entries.len();
        for entry in entries {
            tables.predictions.insert(entry.entity_id.clone(), entry);
        }
        Ok(count)
    }

    async fn list_predictions(&self) -> Result<Vec<PredictionEntry>> {
        self.check(None)?;
        Ok(self.tables.lock().predictions.values().cloned().collect())
    }
}

#[async_trait]
impl FailureMarkerStore for MemoryStore {
    async fn insert_new_markers(&self, markers: Vec<FailureMarker>) -> Result<usize> {
        self.check(Some(FaultPoint::InsertMarkers))?;
        let mut tables = self.tables.lock();
        let mut inserted = 0;
        for marker in markers {
            let key = (marker.entity_id.clone(), marker.failure_type);
            if !tables.markers.contains_key(&key) {
                tables.markers.insert(key, marker);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn retain_markers_for(&self, entities: &BTreeSet<String>) -> Result<usize> {
        self.check(Some(FaultPoint::RetainMarkers))?;
        let mut tables = self.tables.lock();
        let before = tables.markers.len();
        tables
            .markers
            .retain(|(entity_id, _), _| entities.contains(entity_id));
        Ok(before - tables.markers.len())
    }

    async fn list_markers(&self) -> Result<Vec<FailureMarker>> {
        self.check(None)?;
        let tables = self.tables.lock();
        let mut markers: Vec<FailureMarker> = tables.markers.values().cloned().collect();
        markers.sort_by(|a, b| {
            a.entity_id
                .cmp(&b.entity_id)
                .then(a.first_failure_time.cmp(&b.first_failure_time))
        });
        Ok(markers)
    }
}

#[async_trait]
impl EpochCommitter for MemoryStore {
    async fn commit_advance(&self, batch: AdvanceBatch) -> Result<CommitReport> {
        self.check(Some(FaultPoint::CommitAdvance))?;
        let mut tables = self.tables.lock();

        let found = tables
            .clocks
            .get(&batch.stream_id)
            .map(|clock| clock.next_epoch)
            .ok_or_else(|| StoreError::NotInitialized(batch.stream_id.clone()))?;
        if found != batch.expected_epoch {
            return Err(StoreError::EpochConflict {
                expected: batch.expected_epoch,
                found,
            });
        }

        let mut report = CommitReport::default();
        for staged in batch.rows {
            let entity_id = staged.row.entity_id.clone();
            let inserted = tables.insert_row(staged.row);
            match (staged.source, inserted) {
                (RowSource::Normal, true) => report.inserted_normal += 1,
                (RowSource::Normal, false) => report.skipped_normal += 1,
                (RowSource::Failure(_), true) => {
                    report.inserted_failure += 1;
                    *report.cursor_advances.entry(entity_id).or_default() += 1;
                }
                (RowSource::Failure(_), false) => report.skipped_failure += 1,
            }
        }

        for (entity_id, steps) in &report.cursor_advances {
            if let Some(config) = tables.failures.get_mut(entity_id) {
                config.failure_cursor += steps;
                trace!(
                    target: "r_fleet::store",
                    entity = %entity_id,
                    cursor = config.failure_cursor,
                    "failure cursor advanced"
                );
            }
        }

        if let Some(clock) = tables.clocks.get_mut(&batch.stream_id) {
            clock.next_epoch = batch.new_epoch;
        }
        report.next_epoch = batch.new_epoch;
        Ok(report)
    }

    async fn reset_all(&self, clock: ClockState) -> Result<()> {
        self.check(None)?;
        let mut tables = self.tables.lock();
        debug!(
            target: "r_fleet::store",
            rows = tables.telemetry.len(),
            failures = tables.failures.len(),
            "truncating all tables"
        );
        *tables = Tables::default();
        tables.clocks.insert(clock.stream_id.clone(), clock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StagedRow;
    use chrono::TimeZone;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn row(secs: i64, entity: &str, temp: f64) -> TelemetryRow {
        TelemetryRow {
            timestamp: origin() + TimeDelta::seconds(secs),
            entity_id: entity.into(),
            reading: Reading {
                engine_temp: temp,
                trans_oil_pressure: 40.0,
                battery_voltage: 12.6,
            },
        }
    }

    #[tokio::test]
    async fn insert_skips_existing_keys() {
        let store = MemoryStore::new();
        let first = store.insert_rows(vec![row(5, "T1", 90.0)]).await.unwrap();
        assert_eq!(first, InsertReport { inserted: 1, skipped: 0 });

        let again = store
            .insert_rows(vec![row(5, "T1", 120.0), row(5, "T2", 91.0)])
            .await
            .unwrap();
        assert_eq!(again, InsertReport { inserted: 1, skipped: 1 });

        let kept = store.rows_for_entity("T1").await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].reading.engine_temp, 90.0);
    }

    #[tokio::test]
    async fn commit_rejects_moved_clock_without_writing() {
        let store = MemoryStore::new();
        store
            .put_clock(ClockState::new("s", origin(), 5))
            .await
            .unwrap();
        let batch = AdvanceBatch {
            stream_id: "s".into(),
            expected_epoch: 3,
            new_epoch: 4,
            rows: vec![StagedRow {
                row: row(20, "T1", 90.0),
                source: RowSource::Normal,
            }],
        };
        let err = store.commit_advance(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::EpochConflict { expected: 3, found: 0 }));
        assert_eq!(store.count_rows().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bucket_averages_label_by_bucket_end() {
        let store = MemoryStore::new();
        store
            .insert_rows(vec![
                row(0, "T1", 80.0),
                row(60, "T1", 100.0),
                row(300, "T1", 70.0),
                row(0, "T2", 50.0),
            ])
            .await
            .unwrap();

        let buckets = store.bucket_averages(origin(), 5, 10).await.unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].bucket_end, origin() + TimeDelta::minutes(5));
        assert_eq!(buckets[0].entity_id, "T1");
        assert_eq!(buckets[0].reading.engine_temp, 90.0);
        assert_eq!(buckets[0].samples, 2);
        assert_eq!(buckets[1].entity_id, "T2");
        assert_eq!(buckets[2].bucket_end, origin() + TimeDelta::minutes(10));

        let capped = store.bucket_averages(origin(), 5, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn armed_fault_fires_once() {
        let store = MemoryStore::new();
        store.arm_fault(FaultPoint::InsertRows);
        assert!(matches!(
            store.insert_rows(vec![row(0, "T1", 1.0)]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.insert_rows(vec![row(0, "T1", 1.0)]).await.is_ok());
    }
}
