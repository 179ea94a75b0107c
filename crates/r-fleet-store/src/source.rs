//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{PredictedFailure, Reading};
use crate::StoreError;

/// Errors raised by an upstream analytic view.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The view could not be evaluated.
    #[error("prediction view unavailable: {0}")]
    Unavailable(String),
    /// The view read from a store that failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One prediction as produced by the upstream view. A view may return several
/// per entity; consumers keep the newest by `prediction_timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    /// Entity the prediction describes.
    pub entity_id: String,
    /// Telemetry time the prediction was computed against.
    pub prediction_timestamp: DateTime<Utc>,
    /// Predicted failure class.
    pub predicted_failure: PredictedFailure,
    /// Estimated hours until failure.
    pub hours_to_failure: Option<f64>,
    /// Time-to-failure model name.
    pub model: Option<String>,
    /// Telemetry snapshot behind the prediction.
    pub snapshot: Reading,
}

/// Black-box analytic view: a function of the current telemetry.
#[async_trait]
pub trait PredictionSource: Send + Sync {
    /// Evaluate the view.
    async fn latest_predictions(&self) -> Result<Vec<RawPrediction>, SourceError>;
}
