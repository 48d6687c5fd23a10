//! Observability for the lag simulator
//!
//! This crate owns everything the shaping engine reports about itself:
//!
//! - **Statistics**: lock-light counters and a latency histogram updated on every
//!   terminal outcome of a shaped unit, read back as coherent snapshots
//! - **Export**: JSON-lines and CSV encodings of snapshots, plus a periodic recorder
//! - **Logging**: `tracing` subscriber initialisation shared by binaries and tests

pub mod exporter;
pub mod histogram;
pub mod logging;
pub mod metrics;
pub mod recorder;

pub use exporter::ExportFormat;
pub use histogram::{HistogramBucket, HistogramConfig, LatencyHistogram, MAX_BUCKETS};
pub use logging::{init_logging, LogConfig};
pub use metrics::{StatsAggregator, StatsSnapshot};
pub use recorder::{RecorderHandle, StatsRecorder};

/// Errors that can occur in the observability system
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Invalid histogram layout: {0}")]
    InvalidHistogram(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for observability operations
pub type Result<T> = std::result::Result<T, ObservabilityError>;
