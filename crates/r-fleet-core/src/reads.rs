//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Read models served to the request layer."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_fleet_common::time::to_delta;
use r_fleet_sim::ActiveFailure;
use r_fleet_store::{BucketAverage, ClockState, FailureMarker, PredictionEntry, Reading, TelemetryRow};
use serde::Serialize;

const FRESH_MINUTES: i64 = 5;
const AGING_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnlineStatus {
    Online,
    Offline,
}

/// Latest reading of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryStatus {
    pub entity_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub reading: Option<Reading>,
    pub status: OnlineStatus,
}

impl TelemetryStatus {
    /// One status per entity, in `entities` order. An entity is online when
    /// its latest reading is within `window` of the newest reading in the fleet.
    pub fn collect<'a>(
        entities: impl IntoIterator<Item = &'a str>,
        latest: Vec<TelemetryRow>,
        window: Duration,
    ) -> Vec<Self> {
        let fleet_latest = latest.iter().map(|row| row.timestamp).max();
        let mut by_entity: HashMap<String, TelemetryRow> = latest
            .into_iter()
            .map(|row| (row.entity_id.clone(), row))
            .collect();

        entities
            .into_iter()
            .map(|entity_id| match (by_entity.remove(entity_id), fleet_latest) {
                (Some(row), Some(newest)) => {
                    let status = if newest - row.timestamp <= to_delta(window) {
                        OnlineStatus::Online
                    } else {
                        OnlineStatus::Offline
                    };
                    Self {
                        entity_id: row.entity_id,
                        timestamp: Some(row.timestamp),
                        reading: Some(row.reading),
                        status,
                    }
                }
                _ => Self {
                    entity_id: entity_id.to_owned(),
                    timestamp: None,
                    reading: None,
                    status: OnlineStatus::Offline,
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Aging,
    Stale,
}

impl Freshness {
    pub fn from_age_minutes(age: i64) -> Self {
        if age <= FRESH_MINUTES {
            Freshness::Fresh
        } else if age < AGING_MINUTES {
            Freshness::Aging
        } else {
            Freshness::Stale
        }
    }
}

/// A cached prediction annotated with its staleness against the telemetry log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionView {
    #[serde(flatten)]
    pub entry: PredictionEntry,
    /// Whole minutes the prediction lags the newest telemetry.
    pub age_minutes: i64,
    pub freshness: Freshness,
    /// Changes whenever the entry is rewritten; clients diff on it.
    pub prediction_key: String,
}

impl PredictionView {
    pub fn new(entry: PredictionEntry, latest_telemetry: Option<DateTime<Utc>>) -> Self {
        let age_minutes = latest_telemetry
            .map(|latest| (latest - entry.prediction_timestamp).num_minutes().max(0))
            .unwrap_or(0);
        let prediction_key = format!(
            "{}_{}",
            entry.entity_id,
            entry.last_updated.format("%Y-%m-%d %H:%M:%S%.3f")
        );
        Self {
            entry,
            age_minutes,
            freshness: Freshness::from_age_minutes(age_minutes),
            prediction_key,
        }
    }

    pub fn collect(
        entries: Vec<PredictionEntry>,
        latest_telemetry: Option<DateTime<Utc>>,
    ) -> Vec<Self> {
        entries
            .into_iter()
            .map(|entry| Self::new(entry, latest_telemetry))
            .collect()
    }

    /// Largest `age_minutes` across `views`.
    pub fn max_age(views: &[Self]) -> Option<i64> {
        views.iter().map(|view| view.age_minutes).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub telemetry: Vec<TelemetryStatus>,
    pub predictions: Vec<PredictionView>,
    pub failures: Vec<ActiveFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<Vec<BucketAverage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<Vec<FailureMarker>>,
}

/// Every row at the newest timestamp in the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestFrame {
    pub timestamp: Option<DateTime<Utc>>,
    pub rows: Vec<TelemetryRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriterStatus {
    NotInitialized {
        stream_id: String,
    },
    Running {
        stream_id: String,
        epoch: i64,
        step_seconds: u64,
        origin: DateTime<Utc>,
        /// Timestamp of the last committed epoch.
        current_time: DateTime<Utc>,
    },
}

impl WriterStatus {
    pub fn from_clock(stream_id: &str, clock: Option<ClockState>) -> Self {
        match clock {
            None => WriterStatus::NotInitialized {
                stream_id: stream_id.to_owned(),
            },
            Some(clock) => WriterStatus::Running {
                current_time: clock.timestamp(clock.next_epoch),
                stream_id: clock.stream_id,
                epoch: clock.next_epoch,
                step_seconds: clock.step_seconds,
                origin: clock.origin,
            },
        }
    }

    pub fn epoch(&self) -> Option<i64> {
        match self {
            WriterStatus::NotInitialized { .. } => None,
            WriterStatus::Running { epoch, .. } => Some(*epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use r_fleet_store::PredictedFailure;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn row(entity: &str, secs: i64) -> TelemetryRow {
        TelemetryRow {
            timestamp: t0() + TimeDelta::seconds(secs),
            entity_id: entity.to_owned(),
            reading: Reading {
                engine_temp: 90.0,
                trans_oil_pressure: 40.0,
                battery_voltage: 12.6,
            },
        }
    }

    #[test]
    fn lagging_and_silent_entities_are_offline() {
        let statuses = TelemetryStatus::collect(
            ["T1", "T2", "T3"],
            vec![row("T1", 100), row("T2", 85)],
            Duration::from_secs(10),
        );
        let by_status: Vec<_> = statuses.iter().map(|s| (s.entity_id.as_str(), s.status)).collect();
        assert_eq!(
            by_status,
            vec![
                ("T1", OnlineStatus::Online),
                ("T2", OnlineStatus::Offline),
                ("T3", OnlineStatus::Offline),
            ]
        );
        assert!(statuses[2].reading.is_none());
    }

    #[test]
    fn freshness_boundaries() {
        assert_eq!(Freshness::from_age_minutes(5), Freshness::Fresh);
        assert_eq!(Freshness::from_age_minutes(6), Freshness::Aging);
        assert_eq!(Freshness::from_age_minutes(59), Freshness::Aging);
        assert_eq!(Freshness::from_age_minutes(60), Freshness::Stale);
    }

    #[test]
    fn prediction_age_is_clamped_and_keyed() {
        let entry = PredictionEntry {
            entity_id: "T1".into(),
            prediction_timestamp: t0(),
            predicted_failure: PredictedFailure::Normal,
            hours_to_failure: None,
            model: None,
            snapshot: row("T1", 0).reading,
            last_updated: t0() + TimeDelta::milliseconds(1500),
        };
        let ahead = PredictionView::new(entry.clone(), Some(t0() - TimeDelta::minutes(3)));
        assert_eq!(ahead.age_minutes, 0);
        assert_eq!(ahead.prediction_key, "T1_2024-05-01 08:00:01.500");

        let behind = PredictionView::new(entry, Some(t0() + TimeDelta::seconds(61 * 60)));
        assert_eq!(behind.age_minutes, 61);
        assert_eq!(behind.freshness, Freshness::Stale);
        assert_eq!(PredictionView::max_age(&[ahead, behind]), Some(61));
    }

    #[test]
    fn writer_status_serializes_with_state_tag() {
        let status = WriterStatus::from_clock("s", Some(ClockState::new("s", t0(), 5)));
        assert_eq!(status.epoch(), Some(0));
        let WriterStatus::Running { current_time, .. } = &status else {
            panic!("expected running status");
        };
        assert_eq!(*current_time, t0());
        assert_eq!(
            WriterStatus::from_clock("s", None),
            WriterStatus::NotInitialized {
                stream_id: "s".into()
            }
        );
    }
}
