//! ---
//! fleet_section: "11-simulation-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Simulation runtime helpers and scenario engines."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use r_fleet_store::{
    AdvanceBatch, ClockState, CommitReport, EpochCommitter, FailureConfig, FailureConfigStore,
    RowSource, SharedStore, StagedRow, TelemetryRow,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::StreamClock;
use crate::seeds::SeedCatalog;
use crate::{Result, SimError};

/// Result of a multi-epoch advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub from_epoch: i64,
    pub to_epoch: i64,
    pub epochs: i64,
    #[serde(flatten)]
    pub report: CommitReport,
}

/// Advances the stream by many epochs in one commit.
///
/// Produces the same rows as repeated [`crate::EpochWriter::write_one_epoch`]
/// calls but derives every failure offset directly from the cursor instead
/// of stepping epoch by epoch.
#[derive(Clone)]
pub struct BulkAdvancer {
    store: SharedStore,
    catalog: Arc<SeedCatalog>,
    clock: StreamClock,
}

impl std::fmt::Debug for BulkAdvancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkAdvancer")
            .field("stream_id", &self.clock.stream_id())
            .finish_non_exhaustive()
    }
}

impl BulkAdvancer {
    pub fn new(store: SharedStore, catalog: Arc<SeedCatalog>, clock: StreamClock) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    pub async fn advance(&self, epochs: i64) -> Result<BulkOutcome> {
        if epochs <= 0 {
            return Err(SimError::InvalidArgument(format!(
                "fast-forward must cover at least one epoch (got {epochs})"
            )));
        }
        let clock = self.clock.read().await?;
        let current = clock.next_epoch;
        let last = current + epochs;

        let failures: HashMap<String, FailureConfig> = self
            .store
            .list_failures()
            .await?
            .into_iter()
            .filter(|config| config.enabled)
            .map(|config| (config.entity_id.clone(), config))
            .collect();

        let mut rows = Vec::new();
        for entity_id in self.catalog.entities() {
            match failures.get(entity_id) {
                None => self.stage_normal(&clock, entity_id, current + 1, last, &mut rows),
                Some(config) => {
                    let eff = config.effective_from_epoch;
                    // Epochs before the failure window keep the normal series.
                    self.stage_normal(&clock, entity_id, current + 1, last.min(eff - 1), &mut rows);
                    self.stage_failure(&clock, config, current, last, &mut rows);
                }
            }
        }

        let staged = rows.len();
        let report = self
            .store
            .commit_advance(AdvanceBatch {
                stream_id: self.clock.stream_id().to_owned(),
                expected_epoch: current,
                new_epoch: last,
                rows,
            })
            .await?;

        for (entity_id, steps) in &report.cursor_advances {
            debug!(
                target: "r_fleet::bulk",
                entity = %entity_id,
                steps,
                "failure cursor advanced"
            );
        }
        info!(
            target: "r_fleet::bulk",
            from = current,
            to = last,
            staged,
            normal = report.inserted_normal,
            failure = report.inserted_failure,
            skipped = report.skipped(),
            "fast-forward committed"
        );
        Ok(BulkOutcome {
            from_epoch: current,
            to_epoch: last,
            epochs,
            report,
        })
    }

    fn stage_normal(
        &self,
        clock: &ClockState,
        entity_id: &str,
        first: i64,
        last: i64,
        rows: &mut Vec<StagedRow>,
    ) {
        for epoch in first..=last {
            if let Some(reading) = self.catalog.normal_reading(entity_id, epoch) {
                rows.push(StagedRow {
                    row: TelemetryRow {
                        timestamp: clock.timestamp(epoch),
                        entity_id: entity_id.to_owned(),
                        reading,
                    },
                    source: RowSource::Normal,
                });
            }
        }
    }

    /// Epoch `e` in `[max(N+1, eff), N+K]` reads offset `c + (e - max(N, eff-1))`,
    /// so the cursor counts from the later of now and activation.
    fn stage_failure(
        &self,
        clock: &ClockState,
        config: &FailureConfig,
        current: i64,
        last: i64,
        rows: &mut Vec<StagedRow>,
    ) {
        let eff = config.effective_from_epoch;
        let first = (current + 1).max(eff);
        let base = current.max(eff - 1);
        let planned = if eff > current {
            (last - eff + 1).clamp(0, last - current)
        } else {
            last - current
        };

        let mut staged = 0;
        for epoch in first..=last {
            let offset = config.failure_cursor + (epoch - base);
            let Some(reading) = self.catalog.failure_reading(config.failure_type, offset) else {
                break;
            };
            rows.push(StagedRow {
                row: TelemetryRow {
                    timestamp: clock.timestamp(epoch),
                    entity_id: config.entity_id.clone(),
                    reading,
                },
                source: RowSource::Failure(config.failure_type),
            });
            staged += 1;
        }
        if staged < planned {
            debug!(
                target: "r_fleet::bulk",
                entity = %config.entity_id,
                planned,
                staged,
                "failure series exhausted mid-batch; entity offline"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FailureRegistry;
    use crate::seeds::GeneratorSpec;
    use chrono::Utc;
    use r_fleet_common::SeriesPolicy;
    use r_fleet_store::{FailureType, MemoryStore, StreamClockStore, TelemetryStore};
    use std::time::Duration;

    async fn setup(failure_len: usize) -> (Arc<MemoryStore>, Arc<SeedCatalog>, BulkAdvancer, FailureRegistry) {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let catalog = Arc::new(
            SeedCatalog::generate(
                &GeneratorSpec {
                    entities: 3,
                    normal_len: 8,
                    failure_len,
                    seed: 3,
                    ..GeneratorSpec::default()
                },
                SeriesPolicy::Wrap,
            )
            .unwrap(),
        );
        let clock = StreamClock::new(store.clone(), "s", Duration::from_secs(5));
        clock.initialize(Utc::now()).await.unwrap();
        let bulk = BulkAdvancer::new(store.clone(), catalog.clone(), clock.clone());
        let registry = FailureRegistry::new(store, catalog.clone(), clock);
        (memory, catalog, bulk, registry)
    }

    #[tokio::test]
    async fn rejects_non_positive_epochs() {
        let (_, _, bulk, _) = setup(4).await;
        assert!(matches!(bulk.advance(0).await, Err(SimError::InvalidArgument(_))));
        assert!(matches!(bulk.advance(-3).await, Err(SimError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn cursor_consumes_offsets_in_order() {
        let (memory, catalog, bulk, registry) = setup(10).await;
        registry.activate("T1", FailureType::Engine).await.unwrap();

        let outcome = bulk.advance(3).await.unwrap();
        assert_eq!(outcome.to_epoch, 3);
        assert_eq!(outcome.report.cursor_advances.get("T1"), Some(&3));

        let rows = memory.rows_for_entity("T1").await.unwrap();
        let expected: Vec<_> = (1..=3)
            .map(|offset| catalog.failure_reading(FailureType::Engine, offset))
            .collect();
        assert_eq!(rows.iter().map(|r| Some(r.reading)).collect::<Vec<_>>(), expected);
        assert_eq!(registry.list_active().await.unwrap()[0].failure_cursor, 3);
        assert_eq!(memory.load_clock("s").await.unwrap().unwrap().next_epoch, 3);
    }

    #[tokio::test]
    async fn exhausted_series_stops_mid_batch() {
        let (memory, _, bulk, registry) = setup(2).await;
        registry.activate("T2", FailureType::Transmission).await.unwrap();

        let outcome = bulk.advance(5).await.unwrap();
        assert_eq!(outcome.report.inserted_failure, 2);
        assert_eq!(memory.rows_for_entity("T2").await.unwrap().len(), 2);
        assert_eq!(memory.rows_for_entity("T1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn future_window_keeps_normal_rows_before_it() {
        let (memory, catalog, bulk, registry) = setup(10).await;
        registry.activate("T3", FailureType::Electrical).await.unwrap();
        // Push the window out by hand so it starts mid-batch.
        memory
            .activate_failure("T3", FailureType::Electrical, 3)
            .await
            .unwrap();

        bulk.advance(4).await.unwrap();
        let rows = memory.rows_for_entity("T3").await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(Some(rows[1].reading), catalog.normal_reading("T3", 2));
        assert_eq!(
            Some(rows[2].reading),
            catalog.failure_reading(FailureType::Electrical, 1)
        );
        assert_eq!(
            Some(rows[3].reading),
            catalog.failure_reading(FailureType::Electrical, 2)
        );
    }
}
