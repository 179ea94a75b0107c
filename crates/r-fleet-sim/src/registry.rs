//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Per-entity failure injection state machine."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::str::FromStr;
use std::sync::Arc;

use r_fleet_store::{FailureConfig, FailureConfigStore, FailureType, SharedStore};
use serde::Serialize;
use tracing::info;

use crate::clock::StreamClock;
use crate::seeds::SeedCatalog;
use crate::{Result, SimError};

/// Whether an active failure still has series left to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    Active,
    /// The cursor consumed the whole failure series; the entity emits nothing.
    Offline,
}

/// An enabled failure together with its series capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveFailure {
    #[serde(flatten)]
    pub config: FailureConfig,
    pub series_len: usize,
    pub status: FailureStatus,
}

/// Failure injection configuration per entity.
///
/// An entity is either inactive (no row, or `enabled = false`) or
/// `Active(type)`. Activation is the only way in; clearing the registry or
/// resetting the stream are the only ways out.
#[derive(Clone)]
pub struct FailureRegistry {
    store: SharedStore,
    catalog: Arc<SeedCatalog>,
    clock: StreamClock,
}

impl std::fmt::Debug for FailureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureRegistry")
            .field("stream_id", &self.clock.stream_id())
            .field("entities", &self.catalog.entity_count())
            .finish_non_exhaustive()
    }
}

impl FailureRegistry {
    pub fn new(store: SharedStore, catalog: Arc<SeedCatalog>, clock: StreamClock) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Activate `failure_type` for `entity_id`, effective from the next
    /// unwritten epoch so history is never rewritten. Re-activation keeps the
    /// cursor.
    pub async fn activate(
        &self,
        entity_id: &str,
        failure_type: FailureType,
    ) -> Result<FailureConfig> {
        if !self.catalog.contains(entity_id) {
            return Err(SimError::InvalidArgument(format!(
                "unknown entity `{entity_id}`"
            )));
        }
        let next_epoch = self
            .clock
            .try_read()
            .await?
            .map_or(0, |clock| clock.next_epoch);
        let config = self
            .store
            .activate_failure(entity_id, failure_type, next_epoch + 1)
            .await?;
        info!(
            target: "r_fleet::failures",
            entity = %entity_id,
            failure_type = %failure_type,
            effective_from = config.effective_from_epoch,
            cursor = config.failure_cursor,
            "failure activated"
        );
        Ok(config)
    }

    /// [`Self::activate`] with a case-insensitive failure type name.
    pub async fn activate_named(&self, entity_id: &str, failure_type: &str) -> Result<FailureConfig> {
        let parsed = FailureType::from_str(failure_type.trim()).map_err(|_| {
            SimError::InvalidArgument(format!("unknown failure type `{failure_type}`"))
        })?;
        self.activate(entity_id, parsed).await
    }

    /// Delete every failure row.
    pub async fn clear_all(&self) -> Result<usize> {
        let removed = self.store.clear_failures().await?;
        info!(target: "r_fleet::failures", removed, "failures cleared");
        Ok(removed)
    }

    pub async fn list_active(&self) -> Result<Vec<FailureConfig>> {
        let mut configs = self.store.list_failures().await?;
        configs.retain(|config| config.enabled);
        Ok(configs)
    }

    /// Active failures annotated with series capacity and offline status.
    pub async fn describe_active(&self) -> Result<Vec<ActiveFailure>> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .map(|config| self.describe(config))
            .collect())
    }

    pub fn describe(&self, config: FailureConfig) -> ActiveFailure {
        let series_len = self.catalog.series_len(config.failure_type);
        let consumed = usize::try_from(config.failure_cursor).unwrap_or(0);
        let status = if consumed >= series_len {
            FailureStatus::Offline
        } else {
            FailureStatus::Active
        };
        ActiveFailure {
            config,
            series_len,
            status,
        }
    }
}
