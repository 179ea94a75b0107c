//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Primary orchestration and lifecycle management."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_fleet_common::time::{to_delta, SharedClock};
use r_fleet_metrics::EngineMetrics;
use r_fleet_sim::ActiveFailure;
use r_fleet_store::{BucketAverage, FailureMarker};
use tracing::trace;

use crate::reads::{PredictionView, TelemetryStatus};

struct Stamped<V> {
    value: V,
    stored_at: Option<DateTime<Utc>>,
}

struct Entries<K, V> {
    /// Bumped by every invalidation.
    generation: u64,
    map: HashMap<K, Stamped<V>>,
}

/// TTL memoization keyed by `K`.
///
/// Mutations call [`ReadCache::invalidate`], which clears the stored stamps
/// so the next read recomputes regardless of the TTL. A value computed
/// across an invalidation is returned to its caller but not stored.
pub struct ReadCache<K, V> {
    name: &'static str,
    ttl: Duration,
    clock: SharedClock,
    entries: Mutex<Entries<K, V>>,
    metrics: Option<EngineMetrics>,
}

impl<K, V> std::fmt::Debug for ReadCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> ReadCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(
        name: &'static str,
        ttl: Duration,
        clock: SharedClock,
        metrics: Option<EngineMetrics>,
    ) -> Self {
        Self {
            name,
            ttl,
            clock,
            entries: Mutex::new(Entries {
                generation: 0,
                map: HashMap::new(),
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let entry = entries.map.get(key)?;
        let stored_at = entry.stored_at?;
        (now - stored_at < to_delta(self.ttl)).then(|| entry.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        let stored_at = Some(self.clock.now());
        self.entries
            .lock()
            .map
            .insert(key, Stamped { value, stored_at });
    }

    fn generation(&self) -> u64 {
        self.entries.lock().generation
    }

    /// Store `value` only if no invalidation happened since `generation`.
    fn put_if_current(&self, generation: u64, key: K, value: V) -> bool {
        let stored_at = Some(self.clock.now());
        let mut entries = self.entries.lock();
        if entries.generation != generation {
            return false;
        }
        entries.map.insert(key, Stamped { value, stored_at });
        true
    }

    /// Return the cached value for `key` or compute, store and return a new
    /// one. `compute` runs without the cache lock held; errors are returned
    /// and not cached, and neither is a value that raced an invalidation.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            self.record(true);
            return Ok(value);
        }
        self.record(false);
        let generation = self.generation();
        let value = compute().await?;
        if !self.put_if_current(generation, key, value.clone()) {
            trace!(
                target: "r_fleet::cache",
                cache = self.name,
                "invalidated during compute; result not stored"
            );
        }
        Ok(value)
    }

    /// Expire every entry now.
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock();
        entries.generation = entries.generation.wrapping_add(1);
        for entry in entries.map.values_mut() {
            entry.stored_at = None;
        }
        trace!(target: "r_fleet::cache", cache = self.name, "invalidated");
    }

    fn record(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache(self.name, hit);
        }
    }
}

/// The read caches fronting the hot read paths.
#[derive(Debug)]
pub struct ReadCaches {
    pub telemetry: ReadCache<(), Vec<TelemetryStatus>>,
    pub predictions: ReadCache<(), Vec<PredictionView>>,
    pub failures: ReadCache<(), Vec<ActiveFailure>>,
    /// Keyed by the requested window in hours.
    pub chart: ReadCache<u32, Vec<BucketAverage>>,
    pub markers: ReadCache<(), Vec<FailureMarker>>,
}

impl ReadCaches {
    pub fn new(ttl: Duration, clock: SharedClock, metrics: Option<EngineMetrics>) -> Self {
        Self {
            telemetry: ReadCache::new("telemetry", ttl, clock.clone(), metrics.clone()),
            predictions: ReadCache::new("predictions", ttl, clock.clone(), metrics.clone()),
            failures: ReadCache::new("failures", ttl, clock.clone(), metrics.clone()),
            chart: ReadCache::new("chart", ttl, clock.clone(), metrics.clone()),
            markers: ReadCache::new("markers", ttl, clock, metrics),
        }
    }

    /// Caches derived from the telemetry log.
    pub fn invalidate_telemetry(&self) {
        self.telemetry.invalidate();
        self.chart.invalidate();
    }

    pub fn invalidate_failures(&self) {
        self.failures.invalidate();
    }

    /// Caches derived from the prediction cache table.
    pub fn invalidate_predictions(&self) {
        self.predictions.invalidate();
        self.markers.invalidate();
    }

    pub fn invalidate_all(&self) {
        self.invalidate_telemetry();
        self.invalidate_failures();
        self.invalidate_predictions();
    }
}
