//! ---
//! fleet_section: "11-simulation-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Single-step and bulk writer agreement tests."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use r_fleet_common::SeriesPolicy;
use r_fleet_sim::{
    BulkAdvancer, EpochWriter, FailureRegistry, GeneratorSpec, SeedCatalog, SimError, StreamClock,
};
use r_fleet_store::{
    FailureType, MemoryStore, SharedStore, StoreSnapshot, StreamClockStore, TelemetryStore,
};

struct Harness {
    memory: Arc<MemoryStore>,
    catalog: Arc<SeedCatalog>,
    clock: StreamClock,
    writer: EpochWriter,
    bulk: BulkAdvancer,
    registry: FailureRegistry,
}

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap()
}

async fn harness(policy: SeriesPolicy) -> Harness {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let catalog = Arc::new(
        SeedCatalog::generate(
            &GeneratorSpec {
                entities: 4,
                normal_len: 5,
                failure_len: 6,
                seed: 2024,
                ..GeneratorSpec::default()
            },
            policy,
        )
        .unwrap(),
    );
    let clock = StreamClock::new(store.clone(), "fleet-telemetry", Duration::from_secs(5));
    clock.initialize(origin()).await.unwrap();
    Harness {
        writer: EpochWriter::new(store.clone(), catalog.clone(), clock.clone()),
        bulk: BulkAdvancer::new(store.clone(), catalog.clone(), clock.clone()),
        registry: FailureRegistry::new(store, catalog.clone(), clock.clone()),
        memory,
        catalog,
        clock,
    }
}

fn tables(memory: &MemoryStore) -> StoreSnapshot {
    memory.snapshot()
}

#[tokio::test]
async fn bulk_matches_sequential_without_failures() {
    for policy in [SeriesPolicy::Wrap, SeriesPolicy::Bounded] {
        let stepped = harness(policy).await;
        let bulk = harness(policy).await;

        for _ in 0..12 {
            stepped.writer.write_one_epoch().await.unwrap();
        }
        bulk.bulk.advance(12).await.unwrap();

        assert_eq!(tables(&stepped.memory), tables(&bulk.memory), "policy {policy:?}");
    }
}

#[tokio::test]
async fn bulk_matches_sequential_with_failures_and_exhaustion() {
    let stepped = harness(SeriesPolicy::Wrap).await;
    let bulk = harness(SeriesPolicy::Wrap).await;

    for h in [&stepped, &bulk] {
        h.writer.write_one_epoch().await.unwrap();
        h.registry.activate("T1", FailureType::Engine).await.unwrap();
        h.registry
            .activate("T3", FailureType::Electrical)
            .await
            .unwrap();
    }

    for _ in 0..9 {
        stepped.writer.write_one_epoch().await.unwrap();
    }
    bulk.bulk.advance(9).await.unwrap();

    assert_eq!(tables(&stepped.memory), tables(&bulk.memory));
    // Six failure offsets exist; three epochs past that the entity is silent.
    assert_eq!(bulk.memory.rows_for_entity("T1").await.unwrap().len(), 7);
}

#[tokio::test]
async fn activation_then_three_epochs_consumes_offsets_one_to_three() {
    let h = harness(SeriesPolicy::Wrap).await;
    h.bulk.advance(4).await.unwrap();
    h.registry.activate("T1", FailureType::Engine).await.unwrap();

    h.bulk.advance(3).await.unwrap();

    let config = &h.registry.list_active().await.unwrap()[0];
    assert_eq!(config.failure_cursor, 3);
    let failure_rows: Vec<_> = h
        .memory
        .rows_for_entity("T1")
        .await
        .unwrap()
        .into_iter()
        .skip(4)
        .map(|row| row.reading)
        .collect();
    let expected: Vec<_> = (1..=3)
        .filter_map(|offset| h.catalog.failure_reading(FailureType::Engine, offset))
        .collect();
    assert_eq!(failure_rows, expected);
}

#[tokio::test]
async fn rejected_fast_forward_writes_nothing() {
    let h = harness(SeriesPolicy::Wrap).await;
    h.registry.activate("T2", FailureType::Transmission).await.unwrap();

    assert!(matches!(h.bulk.advance(0).await, Err(SimError::InvalidArgument(_))));
    assert_eq!(h.memory.count_rows().await.unwrap(), 0);
    assert_eq!(h.registry.list_active().await.unwrap()[0].failure_cursor, 0);
}

#[tokio::test]
async fn activation_never_touches_written_history() {
    let h = harness(SeriesPolicy::Wrap).await;
    h.bulk.advance(3).await.unwrap();
    let before = h.memory.rows_for_entity("T4").await.unwrap();

    h.registry.activate("T4", FailureType::Engine).await.unwrap();
    h.writer.write_one_epoch().await.unwrap();

    let after = h.memory.rows_for_entity("T4").await.unwrap();
    assert_eq!(&after[..3], &before[..]);
    assert_eq!(
        Some(after[3].reading),
        h.catalog.failure_reading(FailureType::Engine, 1)
    );
}

#[tokio::test]
async fn retrying_a_partially_written_epoch_adds_no_duplicates() {
    let h = harness(SeriesPolicy::Wrap).await;
    let clock = h.clock.read().await.unwrap();

    // A crashed writer left epoch 1 rows behind without moving the clock.
    let orphaned: Vec<_> = h
        .catalog
        .entities()
        .take(2)
        .map(|entity| r_fleet_store::TelemetryRow {
            timestamp: clock.timestamp(1),
            entity_id: entity.to_owned(),
            reading: h.catalog.normal_reading(entity, 1).unwrap(),
        })
        .collect();
    h.memory.insert_rows(orphaned).await.unwrap();

    let outcome = h.writer.write_one_epoch().await.unwrap();
    assert_eq!(outcome.epoch, 1);
    assert_eq!(outcome.report.skipped_normal, 2);
    assert_eq!(outcome.report.skipped_failure, 0);
    assert_eq!(outcome.report.inserted_normal, 2);
    assert_eq!(h.memory.count_rows().await.unwrap(), 4);
    assert_eq!(
        h.memory
            .load_clock("fleet-telemetry")
            .await
            .unwrap()
            .unwrap()
            .next_epoch,
        1
    );
}
