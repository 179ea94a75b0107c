//! ---
//! fleet_section: "11-simulation-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Simulation runtime helpers and scenario engines."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_fleet_store::{ClockState, SharedStore, StreamClockStore};
use tracing::info;

use crate::{Result, SimError};

/// Logical-time authority of one telemetry stream.
///
/// Holds no state of its own; the clock row in the store is the single source
/// of truth for the current epoch.
#[derive(Clone)]
pub struct StreamClock {
    store: SharedStore,
    stream_id: String,
    step: Duration,
}

impl std::fmt::Debug for StreamClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClock")
            .field("stream_id", &self.stream_id)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl StreamClock {
    pub fn new(store: SharedStore, stream_id: impl Into<String>, step: Duration) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            step,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Clock row for a fresh stream starting at `origin`.
    pub fn fresh(&self, origin: DateTime<Utc>) -> ClockState {
        ClockState::new(self.stream_id.clone(), origin, self.step.as_secs())
    }

    /// Create the clock row unless one exists; an existing clock is untouched.
    pub async fn initialize(&self, now: DateTime<Utc>) -> Result<ClockState> {
        let clock = self.store.create_clock_if_missing(self.fresh(now)).await?;
        info!(
            target: "r_fleet::clock",
            stream = %self.stream_id,
            epoch = clock.next_epoch,
            origin = %clock.origin,
            "stream clock ready"
        );
        Ok(clock)
    }

    /// The clock row, or `None` before initialisation.
    pub async fn try_read(&self) -> Result<Option<ClockState>> {
        Ok(self.store.load_clock(&self.stream_id).await?)
    }

    pub async fn read(&self) -> Result<ClockState> {
        self.try_read()
            .await?
            .ok_or_else(|| SimError::NotInitialized(self.stream_id.clone()))
    }

    /// `next_epoch += by`; returns the new epoch.
    pub async fn advance(&self, by: i64) -> Result<i64> {
        Ok(self.store.advance_clock(&self.stream_id, by).await?)
    }

    /// Restart the stream at epoch zero with `origin = now`.
    pub async fn reset(&self, now: DateTime<Utc>) -> Result<ClockState> {
        let clock = self.fresh(now);
        self.store.put_clock(clock.clone()).await?;
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use r_fleet_store::MemoryStore;
    use std::sync::Arc;

    fn clock() -> StreamClock {
        StreamClock::new(Arc::new(MemoryStore::new()), "s", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn read_before_initialize_fails() {
        let clock = clock();
        assert!(matches!(clock.read().await, Err(SimError::NotInitialized(_))));
        assert!(matches!(clock.advance(1).await, Err(SimError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let clock = clock();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        clock.initialize(t0).await.unwrap();
        clock.advance(3).await.unwrap();

        let again = clock
            .initialize(t0 + chrono::TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(again.next_epoch, 3);
        assert_eq!(again.origin, t0);
    }

    #[tokio::test]
    async fn reset_restarts_at_zero() {
        let clock = clock();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        clock.initialize(t0).await.unwrap();
        clock.advance(10).await.unwrap();
        let t1 = t0 + chrono::TimeDelta::minutes(30);
        clock.reset(t1).await.unwrap();

        let state = clock.read().await.unwrap();
        assert_eq!(state.next_epoch, 0);
        assert_eq!(state.origin, t1);
        assert_eq!(state.timestamp(2), t1 + chrono::TimeDelta::seconds(10));
    }
}
