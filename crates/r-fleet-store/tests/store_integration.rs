//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Integration tests for the in-process fleet store."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use r_fleet_store::{
    AdvanceBatch, ClockState, EpochCommitter, FailureConfigStore, FailureMarker,
    FailureMarkerStore, FailureType, MemoryStore, PredictionCacheStore, Reading, RowSource,
    StagedRow, StoreError, StreamClockStore, TelemetryRow, TelemetryStore,
};
use tempfile::tempdir;

const STREAM: &str = "fleet-telemetry";

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

fn staged(epoch: i64, entity: &str, source: RowSource) -> StagedRow {
    StagedRow {
        row: TelemetryRow {
            timestamp: origin() + TimeDelta::seconds(epoch * 5),
            entity_id: entity.into(),
            reading: Reading {
                engine_temp: 90.0 + epoch as f64,
                trans_oil_pressure: 42.0,
                battery_voltage: 12.6,
            },
        },
        source,
    }
}

async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .create_clock_if_missing(ClockState::new(STREAM, origin(), 5))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn reactivation_keeps_cursor_and_moves_window() {
    let store = seeded_store().await;
    store
        .activate_failure("T1", FailureType::Engine, 1)
        .await
        .unwrap();

    let batch = AdvanceBatch {
        stream_id: STREAM.into(),
        expected_epoch: 0,
        new_epoch: 2,
        rows: vec![
            staged(1, "T1", RowSource::Failure(FailureType::Engine)),
            staged(2, "T1", RowSource::Failure(FailureType::Engine)),
        ],
    };
    store.commit_advance(batch).await.unwrap();

    let config = store
        .activate_failure("T1", FailureType::Transmission, 3)
        .await
        .unwrap();
    assert_eq!(config.failure_cursor, 2);
    assert_eq!(config.failure_type, FailureType::Transmission);
    assert_eq!(config.effective_from_epoch, 3);
}

#[tokio::test]
async fn commit_counts_only_inserted_failure_rows() {
    let store = seeded_store().await;
    store
        .activate_failure("T1", FailureType::Electrical, 1)
        .await
        .unwrap();
    store
        .insert_rows(vec![staged(1, "T1", RowSource::Normal).row])
        .await
        .unwrap();

    let report = store
        .commit_advance(AdvanceBatch {
            stream_id: STREAM.into(),
            expected_epoch: 0,
            new_epoch: 2,
            rows: vec![
                staged(1, "T1", RowSource::Failure(FailureType::Electrical)),
                staged(2, "T1", RowSource::Failure(FailureType::Electrical)),
                staged(1, "T2", RowSource::Normal),
                staged(2, "T2", RowSource::Normal),
            ],
        })
        .await
        .unwrap();

    assert_eq!(report.skipped_failure, 1);
    assert_eq!(report.skipped_normal, 0);
    assert_eq!(report.inserted_failure, 1);
    assert_eq!(report.inserted_normal, 2);
    assert_eq!(report.cursor_advances.get("T1"), Some(&1));
    assert_eq!(store.list_failures().await.unwrap()[0].failure_cursor, 1);
    assert_eq!(
        store.load_clock(STREAM).await.unwrap().unwrap().next_epoch,
        2
    );
}

#[tokio::test]
async fn unavailable_store_leaves_state_untouched() {
    let store = seeded_store().await;
    store.set_available(false);
    let err = store
        .commit_advance(AdvanceBatch {
            stream_id: STREAM.into(),
            expected_epoch: 0,
            new_epoch: 1,
            rows: vec![staged(1, "T1", RowSource::Normal)],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));

    store.set_available(true);
    assert_eq!(store.count_rows().await.unwrap(), 0);
    assert_eq!(
        store.load_clock(STREAM).await.unwrap().unwrap().next_epoch,
        0
    );
}

#[tokio::test]
async fn markers_are_insert_once_and_pruned_by_entity() {
    let store = seeded_store().await;
    let marker = |entity: &str, minutes: i64| FailureMarker {
        entity_id: entity.into(),
        failure_type: FailureType::Engine,
        first_failure_time: origin() + TimeDelta::minutes(minutes),
        recorded_at: origin(),
    };

    assert_eq!(
        store
            .insert_new_markers(vec![marker("T1", 5), marker("T2", 5)])
            .await
            .unwrap(),
        2
    );
    assert_eq!(store.insert_new_markers(vec![marker("T1", 30)]).await.unwrap(), 0);

    let kept: BTreeSet<String> = ["T1".to_owned()].into_iter().collect();
    assert_eq!(store.retain_markers_for(&kept).await.unwrap(), 1);

    let markers = store.list_markers().await.unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].first_failure_time, origin() + TimeDelta::minutes(5));
}

#[tokio::test]
async fn reset_truncates_everything_but_the_new_clock() {
    let store = seeded_store().await;
    store
        .activate_failure("T1", FailureType::Engine, 1)
        .await
        .unwrap();
    store
        .insert_rows(vec![staged(1, "T1", RowSource::Normal).row])
        .await
        .unwrap();
    store.advance_clock(STREAM, 7).await.unwrap();

    let later = origin() + TimeDelta::hours(1);
    store
        .reset_all(ClockState::new(STREAM, later, 5))
        .await
        .unwrap();

    let clock = store.load_clock(STREAM).await.unwrap().unwrap();
    assert_eq!(clock.next_epoch, 0);
    assert_eq!(clock.origin, later);
    assert!(store.list_failures().await.unwrap().is_empty());
    assert!(store.list_predictions().await.unwrap().is_empty());
    assert_eq!(store.count_rows().await.unwrap(), 0);
}

#[tokio::test]
async fn snapshot_restores_all_tables() -> anyhow::Result<()> {
    let store = seeded_store().await;
    store
        .activate_failure("T3", FailureType::Transmission, 1)
        .await?;
    store
        .commit_advance(AdvanceBatch {
            stream_id: STREAM.into(),
            expected_epoch: 0,
            new_epoch: 1,
            rows: vec![
                staged(1, "T1", RowSource::Normal),
                staged(1, "T3", RowSource::Failure(FailureType::Transmission)),
            ],
        })
        .await?;

    let dir = tempdir()?;
    let path = dir.path().join("fleet-store.json");
    store.save_snapshot(&path)?;

    let restored = MemoryStore::load_snapshot(&path)?;
    assert_eq!(restored.snapshot(), store.snapshot());
    assert_eq!(restored.list_failures().await?[0].failure_cursor, 1);
    assert_eq!(restored.latest_per_entity().await?.len(), 2);
    Ok(())
}
