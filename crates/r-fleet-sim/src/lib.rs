//! ---
//! fleet_section: "11-simulation"
//! fleet_subsection: "01-bootstrap"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Simulation runtime module exports and shared types."
//! fleet_version: "v0.1.0"
//! fleet_owner: "tbd"
//! ---
//! Epoch-driven telemetry simulation: deterministic seed series, the logical
//! stream clock, per-entity failure injection, and the single-step and bulk
//! writers that advance the stream.

pub mod bulk;
pub mod clock;
pub mod registry;
pub mod seeds;
pub mod view;
pub mod writer;

use r_fleet_store::StoreError;

pub use bulk::{BulkAdvancer, BulkOutcome};
pub use clock::StreamClock;
pub use registry::{ActiveFailure, FailureRegistry, FailureStatus};
pub use seeds::{GeneratorSpec, SeedCatalog, SeedError};
pub use view::{ThresholdView, Thresholds};
pub use writer::{EpochOutcome, EpochWriter};

/// Result alias for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors raised while advancing or configuring the simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("stream `{0}` is not initialised")]
    NotInitialized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotInitialized(stream) => SimError::NotInitialized(stream),
            other => SimError::Store(other),
        }
    }
}
