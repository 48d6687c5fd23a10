//! Error types for the simulator

use serde::Serialize;
use thiserror::Error;

/// A candidate configuration was rejected; the active one is untouched
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("Malformed configuration: {0}")]
    Malformed(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending field as it appears in JSON
    pub fn field(&self) -> &str {
        match self {
            Self::OutOfRange { field, .. } => field,
            Self::Malformed(_) => "body",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::OutOfRange { reason, .. } => reason.clone(),
            Self::Malformed(reason) => reason.clone(),
        }
    }

    /// Body returned to control-surface callers
    pub fn to_rejection(&self) -> ConfigRejection {
        ConfigRejection {
            field: self.field().to_string(),
            reason: self.reason(),
        }
    }
}

/// Wire form of a [`ConfigError`]
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ConfigRejection {
    pub field: String,
    pub reason: String,
}

/// Scheduling failures inside a flow
///
/// Only [`ShaperError::FlowClosed`] ever reaches a caller; the other variants
/// are absorbed into statistics where they occur.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaperError {
    #[error("Delay line full ({0} units pending)")]
    CapacityExceeded(usize),

    #[error("Flow {0} was cancelled")]
    CancelledFlow(u64),

    #[error("Flow {0} is closed")]
    FlowClosed(u64),
}

/// Top-level error for service startup and wiring
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Failed to bind forwarder: {0}")]
    ForwarderBind(String),

    #[error("Observability error: {0}")]
    Observability(#[from] observability::ObservabilityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
