//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the core runtime."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_stream_id() -> String {
    "fleet-telemetry".to_owned()
}

fn default_step() -> Duration {
    Duration::from_secs(5)
}

fn default_max_fast_forward_epochs() -> i64 {
    // One week at the default step.
    120_960
}

fn default_entity_count() -> usize {
    10
}

fn default_entity_prefix() -> String {
    "T".to_owned()
}

fn default_normal_len() -> usize {
    720
}

fn default_failure_len() -> usize {
    360
}

fn default_seed() -> u64 {
    0xF1EE7u64
}

fn default_cooldown() -> Duration {
    Duration::from_secs(15)
}

fn default_stale_after_minutes() -> i64 {
    60
}

fn default_fast_forward_trigger_hours() -> u64 {
    1
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3)
}

fn default_online_window() -> Duration {
    Duration::from_secs(10)
}

fn default_chart_bucket_minutes() -> u32 {
    5
}

fn default_chart_row_limit() -> usize {
    2000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the R-Fleet runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub seeds: SeedConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reads: ReadConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_FLEET_CONFIG";

    /// Load configuration from disk, respecting the `R_FLEET_CONFIG` override.
    ///
    /// A missing file is not fatal: defaults apply and `source` is `None`.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        self.seeds.validate()?;
        if self.cache.ttl.is_zero() {
            return Err(anyhow!("cache.ttl_ms must be greater than zero"));
        }
        if self.reads.chart_bucket_minutes == 0 {
            return Err(anyhow!("reads.chart_bucket_minutes must be greater than zero"));
        }
        if self.refresh.stale_after_minutes <= 0 {
            return Err(anyhow!("refresh.stale_after_minutes must be positive"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Logical clock settings for the simulated telemetry stream.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
    /// Simulated wall time covered by one epoch.
    #[serde(default = "default_step", rename = "step_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub step: Duration,
    /// Largest span a single fast-forward may stage.
    #[serde(default = "default_max_fast_forward_epochs")]
    pub max_fast_forward_epochs: i64,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step.as_secs() == 0 {
            return Err(anyhow!("stream.step_secs must be at least one second"));
        }
        if self.stream_id.trim().is_empty() {
            return Err(anyhow!("stream.stream_id must not be empty"));
        }
        if self.max_fast_forward_epochs <= 0 {
            return Err(anyhow!("stream.max_fast_forward_epochs must be positive"));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: default_stream_id(),
            step: default_step(),
            max_fast_forward_epochs: default_max_fast_forward_epochs(),
        }
    }
}

/// How a normal series is indexed once the requested offset runs past its end.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SeriesPolicy {
    /// Offsets cycle through the series indefinitely.
    #[default]
    Wrap,
    /// Offsets past the end produce no reading.
    Bounded,
}

/// Where the deterministic reading generators come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeedSource {
    Generated {
        #[serde(default = "default_entity_count")]
        entities: usize,
        #[serde(default = "default_entity_prefix")]
        entity_prefix: String,
        #[serde(default = "default_normal_len")]
        normal_len: usize,
        #[serde(default = "default_failure_len")]
        failure_len: usize,
        #[serde(default = "default_seed")]
        seed: u64,
    },
    Csv {
        directory: PathBuf,
    },
}

impl Default for SeedSource {
    fn default() -> Self {
        SeedSource::Generated {
            entities: default_entity_count(),
            entity_prefix: default_entity_prefix(),
            normal_len: default_normal_len(),
            failure_len: default_failure_len(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SeedConfig {
    #[serde(default)]
    pub source: SeedSource,
    #[serde(default)]
    pub normal_policy: SeriesPolicy,
}

impl SeedConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            SeedSource::Generated {
                entities,
                normal_len,
                failure_len,
                ..
            } => {
                if *entities == 0 {
                    return Err(anyhow!("seeds.source.entities must be greater than zero"));
                }
                if *normal_len == 0 || *failure_len == 0 {
                    return Err(anyhow!("generated seed series must not be empty"));
                }
            }
            SeedSource::Csv { directory } => {
                if !directory.is_dir() {
                    return Err(anyhow!(
                        "seed directory {} does not exist or is not a directory",
                        directory.display()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Throttling and staleness settings for the prediction cache refresh.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Minimum wall-clock spacing between two refresh executions.
    #[serde(default = "default_cooldown", rename = "cooldown_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cooldown: Duration,
    /// Simulated-time staleness that makes a prediction read request a refresh.
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: i64,
    /// Fast-forwards spanning at least this many simulated hours request a refresh.
    #[serde(default = "default_fast_forward_trigger_hours")]
    pub fast_forward_trigger_hours: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            stale_after_minutes: default_stale_after_minutes(),
            fast_forward_trigger_hours: default_fast_forward_trigger_hours(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl", rename = "ttl_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
        }
    }
}

/// Shaping of the read models served to the request layer.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Entities whose latest reading lags the fleet by more than this are offline.
    #[serde(default = "default_online_window", rename = "online_window_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub online_window: Duration,
    #[serde(default = "default_chart_bucket_minutes")]
    pub chart_bucket_minutes: u32,
    #[serde(default = "default_chart_row_limit")]
    pub chart_row_limit: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            online_window: default_online_window(),
            chart_bucket_minutes: default_chart_bucket_minutes(),
            chart_row_limit: default_chart_row_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Snapshot file that makes the in-process store durable between CLI runs.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.stream.step, Duration::from_secs(5));
        assert_eq!(config.stream.max_fast_forward_epochs, 120_960);
        assert_eq!(config.refresh.cooldown, Duration::from_secs(15));
        assert_eq!(config.refresh.stale_after_minutes, 60);
        assert_eq!(config.cache.ttl, Duration::from_millis(3000));
        assert_eq!(config.seeds.normal_policy, SeriesPolicy::Wrap);
        assert!(matches!(
            config.seeds.source,
            SeedSource::Generated { entities: 10, .. }
        ));
    }

    #[test]
    fn parses_sections_and_units() {
        let config: AppConfig = r#"
            [stream]
            stream_id = "demo"
            step_secs = 10

            [seeds]
            normal_policy = "bounded"
            [seeds.source]
            kind = "generated"
            entities = 3
            normal_len = 50
            failure_len = 20

            [refresh]
            cooldown_secs = 1

            [cache]
            ttl_ms = 250
        "#
        .parse()
        .unwrap();
        assert_eq!(config.stream.stream_id, "demo");
        assert_eq!(config.stream.step, Duration::from_secs(10));
        assert_eq!(config.seeds.normal_policy, SeriesPolicy::Bounded);
        assert_eq!(config.refresh.cooldown, Duration::from_secs(1));
        assert_eq!(config.cache.ttl, Duration::from_millis(250));
        match config.seeds.source {
            SeedSource::Generated {
                entities,
                entity_prefix,
                normal_len,
                ..
            } => {
                assert_eq!(entities, 3);
                assert_eq!(entity_prefix, "T");
                assert_eq!(normal_len, 50);
            }
            other => panic!("unexpected seed source {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_step() {
        let err = "[stream]\nstep_secs = 0\n".parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("step_secs"));
    }

    #[test]
    fn rejects_non_positive_fast_forward_cap() {
        let err = "[stream]\nmax_fast_forward_epochs = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("max_fast_forward_epochs"));
    }

    #[test]
    fn rejects_missing_seed_directory() {
        let err = r#"
            [seeds.source]
            kind = "csv"
            directory = "/definitely/not/here"
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("seed directory"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        fs::write(&path, "[cache]\nttl_ms = 500\n").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.cache.ttl, Duration::from_millis(500));
    }

    #[test]
    fn shipped_dev_config_parses() {
        let config: AppConfig = include_str!("../../../configs/example.dev.toml")
            .parse()
            .unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.store.snapshot_path.is_some());
        assert!(!config.metrics.enabled);
    }
}
