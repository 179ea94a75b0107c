//! ---
//! fleet_section: "11-simulation-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Simulation runtime helpers and scenario engines."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use async_trait::async_trait;
use r_fleet_store::{
    PredictedFailure, PredictionSource, RawPrediction, Reading, SharedStore, SourceError,
    TelemetryStore,
};

const MODEL_NAME: &str = "threshold-v1";

/// Signal limits past which an entity is predicted to fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub engine_temp_warn: f64,
    pub engine_temp_limit: f64,
    pub oil_pressure_warn: f64,
    pub oil_pressure_limit: f64,
    pub battery_warn: f64,
    pub battery_limit: f64,
    /// Hours to failure reported when a signal sits exactly on its warn line.
    pub horizon_hours: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            engine_temp_warn: 110.0,
            engine_temp_limit: 130.0,
            oil_pressure_warn: 25.0,
            oil_pressure_limit: 15.0,
            battery_warn: 11.0,
            battery_limit: 10.2,
            horizon_hours: 24.0,
        }
    }
}

impl Thresholds {
    fn classify(&self, reading: &Reading) -> (PredictedFailure, Option<f64>) {
        let candidates = [
            (
                PredictedFailure::Engine,
                margin(reading.engine_temp, self.engine_temp_warn, self.engine_temp_limit),
            ),
            (
                PredictedFailure::Transmission,
                margin(
                    reading.trans_oil_pressure,
                    self.oil_pressure_warn,
                    self.oil_pressure_limit,
                ),
            ),
            (
                PredictedFailure::Electrical,
                margin(reading.battery_voltage, self.battery_warn, self.battery_limit),
            ),
        ];
        // The signal closest to its limit wins.
        candidates
            .into_iter()
            .filter_map(|(class, remaining)| remaining.map(|r| (class, r)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or((PredictedFailure::Normal, None), |(class, remaining)| {
                (class, Some(remaining * self.horizon_hours))
            })
    }
}

/// Fraction of the warn-to-limit band still left, or `None` before the warn line.
/// Works for rising (temperature) and falling (pressure, voltage) signals.
fn margin(value: f64, warn: f64, limit: f64) -> Option<f64> {
    let band = limit - warn;
    let progressed = (value - warn) / band;
    if progressed < 0.0 {
        return None;
    }
    Some((1.0 - progressed).clamp(0.0, 1.0))
}

/// Stand-in analytic view: classifies each entity's latest reading against
/// fixed thresholds.
#[derive(Clone)]
pub struct ThresholdView {
    store: SharedStore,
    thresholds: Thresholds,
}

impl std::fmt::Debug for ThresholdView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdView")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ThresholdView {
    pub fn new(store: SharedStore, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }
}

#[async_trait]
impl PredictionSource for ThresholdView {
    async fn latest_predictions(&self) -> Result<Vec<RawPrediction>, SourceError> {
        let latest = self.store.latest_per_entity().await?;
        Ok(latest
            .into_iter()
            .map(|row| {
                let (predicted_failure, hours_to_failure) = self.thresholds.classify(&row.reading);
                RawPrediction {
                    entity_id: row.entity_id,
                    prediction_timestamp: row.timestamp,
                    predicted_failure,
                    hours_to_failure,
                    model: Some(MODEL_NAME.to_owned()),
                    snapshot: row.reading,
                }
            })
            .collect())
    }
}
