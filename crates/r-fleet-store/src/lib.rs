//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Table model and access traits for the fleet telemetry store.
//!
//! The engine talks to storage only through the per-table traits in [`dao`];
//! [`MemoryStore`] is the in-process implementation used by the daemon and
//! by tests, made durable through hashed snapshots.
#![warn(missing_docs)]

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the store subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// No clock row exists for the requested stream.
    #[error("stream `{0}` is not initialised")]
    NotInitialized(String),
    /// An advance was committed against a clock that moved underneath it.
    #[error("epoch conflict: expected next_epoch {expected}, found {found}")]
    EpochConflict {
        /// Epoch the batch was staged against.
        expected: i64,
        /// Epoch currently recorded by the clock.
        found: i64,
    },
    /// Wrapper for IO errors encountered while reading/writing snapshot files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a snapshot fails integrity verification.
    #[error("snapshot hash mismatch")]
    HashMismatch,
}

pub mod dao;
pub mod memory;
pub mod model;
pub mod snapshot;
pub mod source;

pub use dao::{
    EpochCommitter, FailureConfigStore, FailureMarkerStore, FleetStore, PredictionCacheStore,
    SharedStore, StreamClockStore, TelemetryStore,
};
pub use memory::{FaultPoint, MemoryStore};
pub use model::{
    AdvanceBatch, BucketAverage, ClockState, CommitReport, FailureConfig, FailureMarker,
    FailureType, InsertReport, PredictedFailure, PredictionEntry, Reading, RowSource, StagedRow,
    TelemetryRow,
};
pub use snapshot::{load_snapshot, save_snapshot, verify_snapshot, StoreSnapshot, SNAPSHOT_VERSION};
pub use source::{PredictionSource, RawPrediction, SourceError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_stream() {
        let err = StoreError::NotInitialized("fleet-telemetry".into());
        assert_eq!(format!("{err}"), "stream `fleet-telemetry` is not initialised");
    }
}
