//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Primary orchestration and lifecycle management."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Engine facade for the fleet telemetry simulation: serialises clock
//! advances, coordinates prediction cache refreshes, and serves cached reads.

pub mod cache;
pub mod engine;
pub mod error;
pub mod reads;
pub mod refresh;

pub use cache::{ReadCache, ReadCaches};
pub use engine::{EngineSettings, FleetEngine};
pub use error::{EngineError, Result};
pub use reads::{
    Dashboard, Freshness, LatestFrame, OnlineStatus, PredictionView, TelemetryStatus,
    WriterStatus,
};
pub use refresh::{
    RefreshCoordinator, RefreshDispatcher, RefreshError, RefreshGuard, RefreshState,
    RefreshStatus, RefreshTrigger,
};
