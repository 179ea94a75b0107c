//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! One access trait per logical table. Implementations must make every
//! method atomic on its own; [`EpochCommitter`] groups the writes of a
//! clock advance into a single transaction.
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    AdvanceBatch, BucketAverage, ClockState, CommitReport, FailureConfig, FailureMarker,
    FailureType, InsertReport, PredictionEntry, TelemetryRow,
};
use crate::Result;

/// Clock table.
#[async_trait]
pub trait StreamClockStore: Send + Sync {
    /// Read the clock row of `stream_id`, if any.
    async fn load_clock(&self, stream_id: &str) -> Result<Option<ClockState>>;

    /// Insert `clock` unless a row for its stream exists; returns the stored row.
    async fn create_clock_if_missing(&self, clock: ClockState) -> Result<ClockState>;

    /// Insert or overwrite the clock row.
    async fn put_clock(&self, clock: ClockState) -> Result<()>;

    /// Add `by` to `next_epoch` and return the new value.
    async fn advance_clock(&self, stream_id: &str, by: i64) -> Result<i64>;
}

/// Failure configuration table.
#[async_trait]
pub trait FailureConfigStore: Send + Sync {
    /// Every configuration row, ordered by entity.
    async fn list_failures(&self) -> Result<Vec<FailureConfig>>;

    /// Merge an activation: insert with a zero cursor, or overwrite
    /// `enabled`, `failure_type` and `effective_from_epoch` keeping the cursor.
    async fn activate_failure(
        &self,
        entity_id: &str,
        failure_type: FailureType,
        effective_from_epoch: i64,
    ) -> Result<FailureConfig>;

    /// Delete every row; returns how many were removed.
    async fn clear_failures(&self) -> Result<usize>;
}

/// Append-only telemetry log keyed by `(timestamp, entity_id)`.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert rows, skipping keys that already exist.
    async fn insert_rows(&self, rows: Vec<TelemetryRow>) -> Result<InsertReport>;

    /// Rows of one entity in time order.
    async fn rows_for_entity(&self, entity_id: &str) -> Result<Vec<TelemetryRow>>;

    /// Rows with `from <= timestamp <= to`, ordered by time then entity.
    async fn rows_between(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<Vec<TelemetryRow>>;

    /// Every row stamped exactly `at`.
    async fn rows_at(&self, at: DateTime<Utc>) -> Result<Vec<TelemetryRow>>;

    /// The newest row of every entity that has one.
    async fn latest_per_entity(&self) -> Result<Vec<TelemetryRow>>;

    /// Newest timestamp in the log.
    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>>;

    /// Per-entity averages of rows at or after `from`, grouped into
    /// `bucket_minutes` buckets labelled by bucket end, ascending, at most `limit`.
    async fn bucket_averages(
        &self,
        from: DateTime<Utc>,
        bucket_minutes: u32,
        limit: usize,
    ) -> Result<Vec<BucketAverage>>;

    /// Number of stored rows.
    async fn count_rows(&self) -> Result<usize>;
}

/// Derived prediction cache, one row per entity.
#[async_trait]
pub trait PredictionCacheStore: Send + Sync {
    /// Insert or replace the row of every entity in `entries`.
    async fn upsert_predictions(&self, entries: Vec<PredictionEntry>) -> Result<usize>;

    /// Every cached prediction, ordered by entity.
    async fn list_predictions(&self) -> Result<Vec<PredictionEntry>>;
}

/// First-failure markers, unique per `(entity_id, failure_type)`.
#[async_trait]
pub trait FailureMarkerStore: Send + Sync {
    /// Insert markers whose `(entity, type)` pair is not yet recorded.
    /// Existing markers are never modified. Returns how many were inserted.
    async fn insert_new_markers(&self, markers: Vec<FailureMarker>) -> Result<usize>;

    /// Delete markers of every entity not in `entities`; returns how many went.
    async fn retain_markers_for(&self, entities: &BTreeSet<String>) -> Result<usize>;

    /// Every marker ordered by entity then time.
    async fn list_markers(&self) -> Result<Vec<FailureMarker>>;
}

/// Multi-table writes that must land together.
#[async_trait]
pub trait EpochCommitter: Send + Sync {
    /// Apply a clock advance in one transaction: insert the staged rows
    /// skipping existing keys, move each failure entity's cursor by the number
    /// of its failure rows actually inserted, and set `next_epoch`.
    ///
    /// Fails with [`crate::StoreError::EpochConflict`] when the clock no
    /// longer sits at `batch.expected_epoch`; nothing is written then.
    async fn commit_advance(&self, batch: AdvanceBatch) -> Result<CommitReport>;

    /// Truncate telemetry, predictions, markers and failure configs, then
    /// store `clock` as the only clock row.
    async fn reset_all(&self, clock: ClockState) -> Result<()>;
}

/// Everything the engine needs from a backing store.
pub trait FleetStore:
    StreamClockStore
    + FailureConfigStore
    + TelemetryStore
    + PredictionCacheStore
    + FailureMarkerStore
    + EpochCommitter
    + 'static
{
}

impl<T> FleetStore for T where
    T: StreamClockStore
        + FailureConfigStore
        + TelemetryStore
        + PredictionCacheStore
        + FailureMarkerStore
        + EpochCommitter
        + 'static
{
}

/// Store handle shared between engine components.
pub type SharedStore = Arc<dyn FleetStore>;
