//! ---
//! fleet_section: "11-simulation-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Simulation runtime helpers and scenario engines."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use indexmap::IndexMap;
use r_fleet_common::{SeedConfig, SeedSource, SeriesPolicy};
use r_fleet_store::{FailureType, Reading};
use rand::prelude::*;
use rand_distr::Normal;
use serde::Deserialize;
use tracing::info;

/// Errors raised while building a [`SeedCatalog`].
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("seed series `{0}` is empty")]
    EmptySeries(String),
    #[error("no seed series for failure type {0}")]
    MissingFailureSeries(FailureType),
    #[error("seed series `{series}` skips from offset {expected} to {found}")]
    OffsetGap {
        series: String,
        expected: i64,
        found: i64,
    },
    #[error("invalid generator parameter: {0}")]
    InvalidParameter(String),
}

const FAILURE_TYPES: [FailureType; 3] = [
    FailureType::Engine,
    FailureType::Transmission,
    FailureType::Electrical,
];

fn failure_file(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::Engine => "engine.csv",
        FailureType::Transmission => "transmission.csv",
        FailureType::Electrical => "electrical.csv",
    }
}

/// Parameters of the deterministic generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSpec {
    pub entities: usize,
    pub entity_prefix: String,
    pub normal_len: usize,
    pub failure_len: usize,
    pub seed: u64,
}

impl Default for GeneratorSpec {
    fn default() -> Self {
        Self {
            entities: 10,
            entity_prefix: "T".into(),
            normal_len: 720,
            failure_len: 360,
            seed: 0xF1EE7,
        }
    }
}

/// Read-only reading generators: one normal series per entity and one series
/// per failure type, all indexed from offset 1.
///
/// The catalog's entity set is the fleet.
#[derive(Debug, Clone)]
pub struct SeedCatalog {
    normal: IndexMap<String, Vec<Reading>>,
    failures: BTreeMap<FailureType, Vec<Reading>>,
    policy: SeriesPolicy,
}

impl SeedCatalog {
    pub fn new(
        normal: IndexMap<String, Vec<Reading>>,
        failures: BTreeMap<FailureType, Vec<Reading>>,
        policy: SeriesPolicy,
    ) -> Result<Self, SeedError> {
        if normal.is_empty() {
            return Err(SeedError::EmptySeries("normal".into()));
        }
        if let Some((entity, _)) = normal.iter().find(|(_, series)| series.is_empty()) {
            return Err(SeedError::EmptySeries(format!("normal/{entity}")));
        }
        for failure_type in FAILURE_TYPES {
            match failures.get(&failure_type) {
                None => return Err(SeedError::MissingFailureSeries(failure_type)),
                Some(series) if series.is_empty() => {
                    return Err(SeedError::EmptySeries(failure_type.to_string()))
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            normal,
            failures,
            policy,
        })
    }

    /// Build the catalog described by configuration.
    pub fn from_config(config: &SeedConfig) -> Result<Self, SeedError> {
        match &config.source {
            SeedSource::Generated {
                entities,
                entity_prefix,
                normal_len,
                failure_len,
                seed,
            } => Self::generate(
                &GeneratorSpec {
                    entities: *entities,
                    entity_prefix: entity_prefix.clone(),
                    normal_len: *normal_len,
                    failure_len: *failure_len,
                    seed: *seed,
                },
                config.normal_policy,
            ),
            SeedSource::Csv { directory } => Self::from_csv_dir(directory, config.normal_policy),
        }
    }

    /// Deterministically synthesise every series from `spec.seed`.
    pub fn generate(spec: &GeneratorSpec, policy: SeriesPolicy) -> Result<Self, SeedError> {
        let mut generator = SeriesGenerator::new(spec.seed)?;
        let mut normal = IndexMap::with_capacity(spec.entities);
        for index in 1..=spec.entities {
            let entity_id = format!("{}{}", spec.entity_prefix, index);
            normal.insert(entity_id, generator.normal_series(spec.normal_len));
        }
        let failures = FAILURE_TYPES
            .iter()
            .map(|&failure_type| {
                (
                    failure_type,
                    generator.failure_series(failure_type, spec.failure_len),
                )
            })
            .collect();
        let catalog = Self::new(normal, failures, policy)?;
        info!(
            target: "r_fleet::seeds",
            entities = spec.entities,
            normal_len = spec.normal_len,
            failure_len = spec.failure_len,
            seed = spec.seed,
            "generated seed catalog"
        );
        Ok(catalog)
    }

    /// Load `normal.csv` (`entity_id,offset,engine_temp,trans_oil_pressure,battery_voltage`)
    /// and one `<type>.csv` per failure type (same columns without `entity_id`).
    pub fn from_csv_dir(directory: &Path, policy: SeriesPolicy) -> Result<Self, SeedError> {
        let mut per_entity: IndexMap<String, Vec<(i64, Reading)>> = IndexMap::new();
        for record in read_csv::<NormalRecord>(&directory.join("normal.csv"))? {
            let reading = record.reading();
            per_entity
                .entry(record.entity_id)
                .or_default()
                .push((record.offset, reading));
        }
        let mut normal = IndexMap::with_capacity(per_entity.len());
        for (entity_id, rows) in per_entity {
            let series = ordered_series(&format!("normal/{entity_id}"), rows)?;
            normal.insert(entity_id, series);
        }

        let mut failures = BTreeMap::new();
        for failure_type in FAILURE_TYPES {
            let path = directory.join(failure_file(failure_type));
            if !path.exists() {
                return Err(SeedError::MissingFailureSeries(failure_type));
            }
            let rows = read_csv::<FailureRecord>(&path)?
                .into_iter()
                .map(|record| (record.offset, record.reading()))
                .collect();
            failures.insert(
                failure_type,
                ordered_series(&failure_type.to_string(), rows)?,
            );
        }

        let catalog = Self::new(normal, failures, policy)?;
        info!(
            target: "r_fleet::seeds",
            directory = %directory.display(),
            entities = catalog.normal.len(),
            "loaded seed catalog from csv"
        );
        Ok(catalog)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> + '_ {
        self.normal.keys().map(String::as_str)
    }

    pub fn entity_count(&self) -> usize {
        self.normal.len()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.normal.contains_key(entity_id)
    }

    pub fn policy(&self) -> SeriesPolicy {
        self.policy
    }

    /// Normal reading of `entity_id` at `offset` (offsets start at 1).
    pub fn normal_reading(&self, entity_id: &str, offset: i64) -> Option<Reading> {
        let series = self.normal.get(entity_id)?;
        let len = i64::try_from(series.len()).ok()?;
        let index = match self.policy {
            SeriesPolicy::Wrap => (offset - 1).rem_euclid(len),
            SeriesPolicy::Bounded if (1..=len).contains(&offset) => offset - 1,
            SeriesPolicy::Bounded => return None,
        };
        series.get(usize::try_from(index).ok()?).copied()
    }

    /// Failure reading at `offset`; `None` once the series is exhausted.
    pub fn failure_reading(&self, failure_type: FailureType, offset: i64) -> Option<Reading> {
        if offset < 1 {
            return None;
        }
        let index = usize::try_from(offset - 1).ok()?;
        self.failures.get(&failure_type)?.get(index).copied()
    }

    /// Number of offsets in the failure series of `failure_type`.
    pub fn series_len(&self, failure_type: FailureType) -> usize {
        self.failures.get(&failure_type).map_or(0, Vec::len)
    }
}

fn ordered_series(name: &str, mut rows: Vec<(i64, Reading)>) -> Result<Vec<Reading>, SeedError> {
    if rows.is_empty() {
        return Err(SeedError::EmptySeries(name.to_owned()));
    }
    rows.sort_by_key(|(offset, _)| *offset);
    // Files may number from 0 or 1; lookups are always 1-based.
    let start = rows[0].0;
    if start != 0 && start != 1 {
        return Err(SeedError::OffsetGap {
            series: name.to_owned(),
            expected: 1,
            found: start,
        });
    }
    let mut series = Vec::with_capacity(rows.len());
    for (expected, (offset, reading)) in (start..).zip(rows) {
        if offset != expected {
            return Err(SeedError::OffsetGap {
                series: name.to_owned(),
                expected,
                found: offset,
            });
        }
        series.push(reading);
    }
    Ok(series)
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, SeedError> {
    let file = std::fs::File::open(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct NormalRecord {
    entity_id: String,
    offset: i64,
    engine_temp: f64,
    trans_oil_pressure: f64,
    battery_voltage: f64,
}

#[derive(Debug, Deserialize)]
struct FailureRecord {
    offset: i64,
    engine_temp: f64,
    trans_oil_pressure: f64,
    battery_voltage: f64,
}

impl NormalRecord {
    fn reading(&self) -> Reading {
        Reading {
            engine_temp: self.engine_temp,
            trans_oil_pressure: self.trans_oil_pressure,
            battery_voltage: self.battery_voltage,
        }
    }
}

impl FailureRecord {
    fn reading(&self) -> Reading {
        Reading {
            engine_temp: self.engine_temp,
            trans_oil_pressure: self.trans_oil_pressure,
            battery_voltage: self.battery_voltage,
        }
    }
}

const ENGINE_TEMP_NOMINAL: f64 = 90.0;
const OIL_PRESSURE_NOMINAL: f64 = 45.0;
const BATTERY_NOMINAL: f64 = 12.6;

struct SeriesGenerator {
    rng: StdRng,
    noise: Normal<f64>,
}

impl SeriesGenerator {
    fn new(seed: u64) -> Result<Self, SeedError> {
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, 1.0)
                .map_err(|err| SeedError::InvalidParameter(err.to_string()))?,
        })
    }

    fn noise_sample(&mut self, scale: f64) -> f64 {
        self.noise.sample(&mut self.rng) * scale
    }

    fn normal_series(&mut self, len: usize) -> Vec<Reading> {
        // Per-entity operating point so trucks do not overlap exactly on charts.
        let temp_bias = self.noise_sample(2.0);
        let pressure_bias = self.noise_sample(1.5);
        let voltage_bias = self.noise_sample(0.1);
        (0..len)
            .map(|_| Reading {
                engine_temp: ENGINE_TEMP_NOMINAL + temp_bias + self.noise_sample(0.8),
                trans_oil_pressure: OIL_PRESSURE_NOMINAL + pressure_bias + self.noise_sample(0.6),
                battery_voltage: BATTERY_NOMINAL + voltage_bias + self.noise_sample(0.04),
            })
            .collect()
    }

    fn failure_series(&mut self, failure_type: FailureType, len: usize) -> Vec<Reading> {
        (0..len)
            .map(|step| {
                let progress = (step + 1) as f64 / len as f64;
                let mut reading = Reading {
                    engine_temp: ENGINE_TEMP_NOMINAL + self.noise_sample(0.8),
                    trans_oil_pressure: OIL_PRESSURE_NOMINAL + self.noise_sample(0.6),
                    battery_voltage: BATTERY_NOMINAL + self.noise_sample(0.04),
                };
                match failure_type {
                    FailureType::Engine => reading.engine_temp += 40.0 * progress,
                    FailureType::Transmission => reading.trans_oil_pressure -= 30.0 * progress,
                    FailureType::Electrical => reading.battery_voltage -= 2.4 * progress,
                }
                reading
            })
            .collect()
    }
}
