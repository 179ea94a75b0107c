//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Persistence abstractions and storage bindings."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::{ClockState, FailureConfig, FailureMarker, PredictionEntry, TelemetryRow};
use crate::{Result, StoreError};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Full table contents of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Clock rows.
    pub clocks: Vec<ClockState>,
    /// Failure configuration rows.
    pub failures: Vec<FailureConfig>,
    /// Telemetry log in key order.
    pub telemetry: Vec<TelemetryRow>,
    /// Prediction cache rows.
    pub predictions: Vec<PredictionEntry>,
    /// First-failure markers.
    pub markers: Vec<FailureMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    state: StoreSnapshot,
}

/// Write `state` to `path` as a JSON envelope carrying a SHA-256 of the payload.
pub fn save_snapshot(state: &StoreSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(state)?,
        state: state.clone(),
    };

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &envelope)?;
    writer.flush()?;
    debug!(
        path = %path.display(),
        rows = state.telemetry.len(),
        "store snapshot written"
    );
    Ok(())
}

/// Load and verify a snapshot.
pub fn load_snapshot(path: &Path) -> Result<StoreSnapshot> {
    let envelope = load_envelope(path)?;
    if envelope.hash != compute_hash(&envelope.state)? {
        return Err(StoreError::HashMismatch);
    }
    Ok(envelope.state)
}

/// Verify the integrity of a snapshot without keeping the payload.
pub fn verify_snapshot(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.state)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(state: &StoreSnapshot) -> Result<String> {
    let serialized = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}
