//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the core runtime."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Core shared primitives for the R-Fleet workspace.
//! This crate exposes configuration loading, logging, and the injectable
//! wall clock consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, CacheConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, ReadConfig,
    RefreshConfig, SeedConfig, SeedSource, SeriesPolicy, StoreConfig, StreamConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
