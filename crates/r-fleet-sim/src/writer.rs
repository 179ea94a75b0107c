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
    AdvanceBatch, CommitReport, EpochCommitter, FailureConfig, FailureConfigStore, RowSource,
    SharedStore, StagedRow, TelemetryRow,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::StreamClock;
use crate::seeds::SeedCatalog;
use crate::Result;

/// Result of a single-step advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochOutcome {
    pub epoch: i64,
    #[serde(flatten)]
    pub report: CommitReport,
}

/// Advances the stream by exactly one epoch.
#[derive(Clone)]
pub struct EpochWriter {
    store: SharedStore,
    catalog: Arc<SeedCatalog>,
    clock: StreamClock,
}

impl std::fmt::Debug for EpochWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochWriter")
            .field("stream_id", &self.clock.stream_id())
            .finish_non_exhaustive()
    }
}

impl EpochWriter {
    pub fn new(store: SharedStore, catalog: Arc<SeedCatalog>, clock: StreamClock) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Write epoch `next_epoch + 1` and move the clock onto it.
    ///
    /// Entities without an effective failure read their normal series at
    /// offset `target`; failing entities read their failure series at
    /// `cursor + 1` and emit nothing once it is exhausted. Rows, cursor steps
    /// and the clock land in one commit, so a failed write leaves the epoch
    /// where it was. Rows whose key already exists are skipped and do not
    /// consume a cursor step.
    pub async fn write_one_epoch(&self) -> Result<EpochOutcome> {
        let clock = self.clock.read().await?;
        let current = clock.next_epoch;
        let target = current + 1;
        let timestamp = clock.timestamp(target);

        let failures: HashMap<String, FailureConfig> = self
            .store
            .list_failures()
            .await?
            .into_iter()
            .filter(|config| config.is_effective_at(target))
            .map(|config| (config.entity_id.clone(), config))
            .collect();

        let mut rows = Vec::with_capacity(self.catalog.entity_count());
        for entity_id in self.catalog.entities() {
            let staged = match failures.get(entity_id) {
                Some(config) => {
                    let offset = config.failure_cursor + 1;
                    match self.catalog.failure_reading(config.failure_type, offset) {
                        Some(reading) => Some((reading, RowSource::Failure(config.failure_type))),
                        None => {
                            debug!(
                                target: "r_fleet::writer",
                                entity = %entity_id,
                                offset,
                                "failure series exhausted; entity offline"
                            );
                            None
                        }
                    }
                }
                None => self
                    .catalog
                    .normal_reading(entity_id, target)
                    .map(|reading| (reading, RowSource::Normal)),
            };
            if let Some((reading, source)) = staged {
                rows.push(StagedRow {
                    row: TelemetryRow {
                        timestamp,
                        entity_id: entity_id.to_owned(),
                        reading,
                    },
                    source,
                });
            }
        }

        let report = self
            .store
            .commit_advance(AdvanceBatch {
                stream_id: self.clock.stream_id().to_owned(),
                expected_epoch: current,
                new_epoch: target,
                rows,
            })
            .await?;

        info!(
            target: "r_fleet::writer",
            epoch = target,
            %timestamp,
            normal = report.inserted_normal,
            failure = report.inserted_failure,
            skipped = report.skipped(),
            "epoch written"
        );
        Ok(EpochOutcome {
            epoch: target,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FailureRegistry;
    use crate::seeds::GeneratorSpec;
    use chrono::Utc;
    use r_fleet_common::SeriesPolicy;
    use r_fleet_store::{
        FailureType, FaultPoint, MemoryStore, StreamClockStore, TelemetryStore,
    };
    use std::time::Duration;

    struct Fixture {
        memory: Arc<MemoryStore>,
        catalog: Arc<SeedCatalog>,
        writer: EpochWriter,
        registry: FailureRegistry,
    }

    async fn fixture(failure_len: usize) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let catalog = Arc::new(
            SeedCatalog::generate(
                &GeneratorSpec {
                    entities: 2,
                    normal_len: 6,
                    failure_len,
                    seed: 11,
                    ..GeneratorSpec::default()
                },
                SeriesPolicy::Wrap,
            )
            .unwrap(),
        );
        let clock = StreamClock::new(store.clone(), "s", Duration::from_secs(5));
        clock.initialize(Utc::now()).await.unwrap();
        Fixture {
            writer: EpochWriter::new(store.clone(), catalog.clone(), clock.clone()),
            registry: FailureRegistry::new(store, catalog.clone(), clock),
            memory,
            catalog,
        }
    }

    #[tokio::test]
    async fn writes_one_row_per_entity() {
        let fx = fixture(3).await;
        let outcome = fx.writer.write_one_epoch().await.unwrap();
        assert_eq!(outcome.epoch, 1);
        assert_eq!(outcome.report.inserted_normal, 2);

        let rows = fx.memory.rows_for_entity("T1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(Some(rows[0].reading), fx.catalog.normal_reading("T1", 1));
    }

    #[tokio::test]
    async fn failure_rows_follow_cursor_then_go_offline() {
        let fx = fixture(2).await;
        fx.registry.activate("T1", FailureType::Engine).await.unwrap();

        for _ in 0..3 {
            fx.writer.write_one_epoch().await.unwrap();
        }

        let rows = fx.memory.rows_for_entity("T1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(Some(rows[0].reading), fx.catalog.failure_reading(FailureType::Engine, 1));
        assert_eq!(Some(rows[1].reading), fx.catalog.failure_reading(FailureType::Engine, 2));
        assert_eq!(fx.memory.rows_for_entity("T2").await.unwrap().len(), 3);
        assert_eq!(fx.registry.list_active().await.unwrap()[0].failure_cursor, 2);
    }

    #[tokio::test]
    async fn failed_commit_leaves_epoch_unchanged() {
        let fx = fixture(3).await;
        fx.memory.arm_fault(FaultPoint::CommitAdvance);
        assert!(fx.writer.write_one_epoch().await.is_err());
        assert_eq!(fx.memory.load_clock("s").await.unwrap().unwrap().next_epoch, 0);
        assert_eq!(fx.memory.count_rows().await.unwrap(), 0);

        let retried = fx.writer.write_one_epoch().await.unwrap();
        assert_eq!(retried.epoch, 1);
    }
}
