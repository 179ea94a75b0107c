//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Primary orchestration and lifecycle management."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use r_fleet_sim::{SeedError, SimError};
use r_fleet_store::StoreError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by mutating engine operations. Reads never return these;
/// they degrade to empty results instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("stream `{0}` is not initialised; run initialize first")]
    StreamNotInitialized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The clock moved between staging and commit.
    #[error("concurrent advance detected: {0}")]
    Conflict(String),
    #[error(transparent)]
    Seed(#[from] SeedError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotInitialized(stream) => EngineError::StreamNotInitialized(stream),
            conflict @ StoreError::EpochConflict { .. } => {
                EngineError::Conflict(conflict.to_string())
            }
            other => EngineError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<SimError> for EngineError {
    fn from(err: SimError) -> Self {
        match err {
            SimError::NotInitialized(stream) => EngineError::StreamNotInitialized(stream),
            SimError::InvalidArgument(message) => EngineError::InvalidArgument(message),
            SimError::Store(store) => store.into(),
        }
    }
}
