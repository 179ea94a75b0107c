//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Failure categories that can be injected into an entity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum FailureType {
    /// Overheating engine.
    Engine,
    /// Transmission oil pressure loss.
    Transmission,
    /// Battery / charging fault.
    Electrical,
}

/// Failure class reported by the upstream analytic view.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PredictedFailure {
    /// No failure expected.
    Normal,
    /// See [`FailureType::Engine`].
    Engine,
    /// See [`FailureType::Transmission`].
    Transmission,
    /// See [`FailureType::Electrical`].
    Electrical,
}

impl PredictedFailure {
    /// The failure category, or `None` for [`PredictedFailure::Normal`].
    pub fn failure(self) -> Option<FailureType> {
        match self {
            PredictedFailure::Normal => None,
            PredictedFailure::Engine => Some(FailureType::Engine),
            PredictedFailure::Transmission => Some(FailureType::Transmission),
            PredictedFailure::Electrical => Some(FailureType::Electrical),
        }
    }
}

impl From<FailureType> for PredictedFailure {
    fn from(value: FailureType) -> Self {
        match value {
            FailureType::Engine => PredictedFailure::Engine,
            FailureType::Transmission => PredictedFailure::Transmission,
            FailureType::Electrical => PredictedFailure::Electrical,
        }
    }
}

/// One sensor sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Engine temperature in °C.
    pub engine_temp: f64,
    /// Transmission oil pressure in psi.
    pub trans_oil_pressure: f64,
    /// Battery voltage in V.
    pub battery_voltage: f64,
}

/// A stored telemetry sample. `(timestamp, entity_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    /// Simulated wall time of the epoch that produced the row.
    pub timestamp: DateTime<Utc>,
    /// Entity that emitted the reading.
    pub entity_id: String,
    /// The sample itself.
    #[serde(flatten)]
    pub reading: Reading,
}

impl TelemetryRow {
    /// Uniqueness key of the row.
    pub fn key(&self) -> (DateTime<Utc>, String) {
        (self.timestamp, self.entity_id.clone())
    }
}

/// Logical clock row of a telemetry stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
    /// Stream the clock belongs to.
    pub stream_id: String,
    /// Wall time of epoch zero.
    pub origin: DateTime<Utc>,
    /// Seconds of simulated time per epoch.
    pub step_seconds: u64,
    /// Next unconsumed epoch index.
    pub next_epoch: i64,
}

impl ClockState {
    /// A fresh clock at epoch zero.
    pub fn new(stream_id: impl Into<String>, origin: DateTime<Utc>, step_seconds: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            origin,
            step_seconds,
            next_epoch: 0,
        }
    }

    /// Wall time of `epoch`: `origin + epoch * step`.
    pub fn timestamp(&self, epoch: i64) -> DateTime<Utc> {
        let step = i64::try_from(self.step_seconds).unwrap_or(i64::MAX);
        let offset = TimeDelta::try_seconds(epoch.saturating_mul(step)).unwrap_or(TimeDelta::MAX);
        self.origin
            .checked_add_signed(offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Per-entity failure injection row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureConfig {
    /// Entity the failure applies to.
    pub entity_id: String,
    /// Whether injection is active.
    pub enabled: bool,
    /// Series the entity's readings are drawn from while active.
    pub failure_type: FailureType,
    /// Number of failure-series offsets consumed since activation.
    pub failure_cursor: i64,
    /// First global epoch that may carry a failure reading.
    pub effective_from_epoch: i64,
}

impl FailureConfig {
    /// True when the failure produces a reading at `epoch`.
    pub fn is_effective_at(&self, epoch: i64) -> bool {
        self.enabled && self.effective_from_epoch <= epoch
    }
}

/// Cached prediction for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEntry {
    /// Entity the prediction describes.
    pub entity_id: String,
    /// Timestamp of the telemetry the prediction was computed against.
    pub prediction_timestamp: DateTime<Utc>,
    /// Predicted failure class.
    pub predicted_failure: PredictedFailure,
    /// Estimated hours until failure, when the view provides one.
    pub hours_to_failure: Option<f64>,
    /// Name of the time-to-failure model used by the view.
    pub model: Option<String>,
    /// Telemetry snapshot the prediction was computed against.
    pub snapshot: Reading,
    /// Wall time the cache row was last written.
    pub last_updated: DateTime<Utc>,
}

/// First time an entity was predicted to fail with a given type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker {
    /// Entity the marker belongs to.
    pub entity_id: String,
    /// Failure class observed.
    pub failure_type: FailureType,
    /// Prediction time floored to the chart bucket.
    pub first_failure_time: DateTime<Utc>,
    /// Wall time the marker was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Where a staged row's reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowSource {
    /// The entity's normal series.
    Normal,
    /// A failure series; inserting such a row consumes one cursor step.
    Failure(FailureType),
}

impl RowSource {
    /// Metrics/log label.
    pub fn label(self) -> &'static str {
        match self {
            RowSource::Normal => "normal",
            RowSource::Failure(_) => "failure",
        }
    }
}

/// A row waiting to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    /// The row to insert.
    pub row: TelemetryRow,
    /// Origin of the reading.
    pub source: RowSource,
}

/// Everything one clock advance writes, applied as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceBatch {
    /// Stream being advanced.
    pub stream_id: String,
    /// `next_epoch` the batch was staged against.
    pub expected_epoch: i64,
    /// `next_epoch` after the commit.
    pub new_epoch: i64,
    /// Rows to insert, skipping existing keys.
    pub rows: Vec<StagedRow>,
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    /// Rows written.
    pub inserted: usize,
    /// Rows whose key already existed.
    pub skipped: usize,
}

/// Outcome of [`crate::EpochCommitter::commit_advance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Normal rows written.
    pub inserted_normal: usize,
    /// Failure rows written.
    pub inserted_failure: usize,
    /// Staged normal rows skipped because their key existed.
    pub skipped_normal: usize,
    /// Staged failure rows skipped because their key existed. These do not
    /// move the cursor.
    pub skipped_failure: usize,
    /// Cursor steps applied per entity.
    pub cursor_advances: BTreeMap<String, i64>,
    /// Clock position after the commit.
    pub next_epoch: i64,
}

impl CommitReport {
    /// Total rows written.
    pub fn inserted(&self) -> usize {
        self.inserted_normal + self.inserted_failure
    }

    /// Total staged rows skipped.
    pub fn skipped(&self) -> usize {
        self.skipped_normal + self.skipped_failure
    }
}

/// Per-entity average over one chart bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketAverage {
    /// End of the bucket, which labels the chart point.
    pub bucket_end: DateTime<Utc>,
    /// Entity the average belongs to.
    pub entity_id: String,
    /// Mean reading over the bucket.
    #[serde(flatten)]
    pub reading: Reading,
    /// Number of samples averaged.
    pub samples: usize,
}
