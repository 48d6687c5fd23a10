//! Core types for link simulation

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Largest accepted base latency or jitter, in milliseconds (10 minutes)
pub const MAX_DELAY_MS: f64 = 600_000.0;

/// Parameters of the simulated link
///
/// Fields omitted from a JSON body take their default (zero) value, so the
/// all-default config is a transparent link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Fixed one-way delay added to every unit
    pub base_latency_ms: f64,
    /// Half-width of the symmetric spread around the base latency
    pub jitter_ms: f64,
    /// Probability (0.0-1.0) that a unit is lost
    pub loss_probability: f64,
    /// Shared link capacity; 0 means unlimited
    pub bandwidth_cap_bytes_per_sec: u64,
    /// Probability (0.0-1.0) that a unit skips the base latency and overtakes others
    pub reorder_probability: f64,
}

impl SimulationConfig {
    /// Check every field against its bound, reporting the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_delay("baseLatencyMs", self.base_latency_ms)?;
        check_delay("jitterMs", self.jitter_ms)?;
        check_probability("lossProbability", self.loss_probability)?;
        check_probability("reorderProbability", self.reorder_probability)?;
        Ok(())
    }

    /// Parse a JSON body and validate it
    ///
    /// Any JSON number is accepted for `bandwidthCapBytesPerSec` at the parse
    /// stage so that negative or fractional caps are reported against that field.
    pub fn from_json(body: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_slice(body).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        let config = Self {
            base_latency_ms: raw.base_latency_ms,
            jitter_ms: raw.jitter_ms,
            loss_probability: raw.loss_probability,
            bandwidth_cap_bytes_per_sec: raw
                .bandwidth_cap_bytes_per_sec
                .as_ref()
                .map_or(Ok(0), check_bandwidth_cap)?,
            reorder_probability: raw.reorder_probability,
        };
        config.validate()?;
        Ok(config)
    }

    /// True when the link has no effect on traffic
    pub fn is_transparent(&self) -> bool {
        self.base_latency_ms == 0.0
            && self.jitter_ms == 0.0
            && self.loss_probability == 0.0
            && self.reorder_probability == 0.0
            && self.bandwidth_cap_bytes_per_sec == 0
    }

    pub fn with_latency(mut self, base_latency_ms: f64, jitter_ms: f64) -> Self {
        self.base_latency_ms = base_latency_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn with_loss(mut self, loss_probability: f64) -> Self {
        self.loss_probability = loss_probability;
        self
    }

    pub fn with_reorder(mut self, reorder_probability: f64) -> Self {
        self.reorder_probability = reorder_probability;
        self
    }

    pub fn with_bandwidth_cap(mut self, bytes_per_sec: u64) -> Self {
        self.bandwidth_cap_bytes_per_sec = bytes_per_sec;
        self
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct RawConfig {
    base_latency_ms: f64,
    jitter_ms: f64,
    loss_probability: f64,
    bandwidth_cap_bytes_per_sec: Option<serde_json::Number>,
    reorder_probability: f64,
}

fn check_bandwidth_cap(value: &serde_json::Number) -> Result<u64, ConfigError> {
    const FIELD: &str = "bandwidthCapBytesPerSec";
    if let Some(cap) = value.as_u64() {
        return Ok(cap);
    }
    if value.as_f64().is_some_and(|v| v < 0.0) {
        return Err(ConfigError::out_of_range(
            FIELD,
            format!("must be >= 0, got {}", value),
        ));
    }
    Err(ConfigError::out_of_range(
        FIELD,
        format!("must be a whole number between 0 and {}, got {}", u64::MAX, value),
    ))
}

fn check_delay(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::out_of_range(field, "must be a finite number"));
    }
    if value < 0.0 {
        return Err(ConfigError::out_of_range(
            field,
            format!("must be >= 0, got {}", value),
        ));
    }
    if value > MAX_DELAY_MS {
        return Err(ConfigError::out_of_range(
            field,
            format!("must be <= {}, got {}", MAX_DELAY_MS, value),
        ));
    }
    Ok(())
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        // NaN also fails the range check
        return Err(ConfigError::out_of_range(
            field,
            format!("must be between 0.0 and 1.0, got {}", value),
        ));
    }
    Ok(())
}

/// One unit of traffic crossing the link
///
/// The payload is carried, never inspected.
#[derive(Debug, Clone)]
pub struct FlowUnit<P> {
    /// Position in the flow's arrival order, starting at 0
    pub sequence: u64,
    pub size_bytes: usize,
    pub arrival: Instant,
    pub payload: P,
}

impl<P> FlowUnit<P> {
    pub fn new(sequence: u64, size_bytes: usize, payload: P) -> Self {
        Self {
            sequence,
            size_bytes,
            arrival: Instant::now(),
            payload,
        }
    }

    pub fn arrived_at(mut self, arrival: Instant) -> Self {
        self.arrival = arrival;
        self
    }
}

/// What the delay model decided for one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Deliver after the delay, measured from arrival
    Deliver(Duration),
    /// Lose the unit
    Drop,
    /// Deliver after the delay, which skips the base latency; `ahead_of_sequence`
    /// is the unit's own arrival sequence
    Reorder {
        delay: Duration,
        ahead_of_sequence: u64,
    },
}

impl Decision {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Deliver(delay) => Some(*delay),
            Self::Reorder { delay, .. } => Some(*delay),
            Self::Drop => None,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }

    pub fn is_reorder(&self) -> bool {
        matches!(self, Self::Reorder { .. })
    }
}

/// A unit handed downstream by a flow
#[derive(Debug, Clone)]
pub struct Delivered<P> {
    pub sequence: u64,
    pub size_bytes: usize,
    /// Time from arrival to delivery
    pub latency: Duration,
    pub reordered: bool,
    pub payload: P,
}
