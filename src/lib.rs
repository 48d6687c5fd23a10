//! Application-level network condition simulator
//!
//! This crate shapes streams of logical units (datagrams, messages) as if they
//! crossed a degraded network link:
//! - Base latency with symmetric jitter
//! - Probabilistic loss and reordering
//! - A bandwidth cap shared by every flow on the link (token bucket)
//! - Live statistics and hot-swappable parameters over HTTP (`/stats`, `/config`)

pub mod bucket;
pub mod config;
pub mod delay;
pub mod errors;
pub mod forwarder;
pub mod presets;
pub mod server;
pub mod settings;
pub mod shaper;
pub mod types;

// Re-exports for public API
pub use bucket::TokenBucket;
pub use config::ConfigStore;
pub use errors::{ConfigError, ShaperError, SimError};
pub use server::{ControlServer, ControlState};
pub use settings::ServiceSettings;
pub use shaper::{FlowHandle, ShaperConfig, TrafficShaper};
pub use types::*;

/// Statistics snapshot echoing the simulation parameters in force when it was taken
pub type StatsSnapshot = observability::StatsSnapshot<SimulationConfig>;
