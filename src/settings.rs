//! Process-level settings: where to listen, what to forward, how to shape

use crate::errors::{Result, SimError};
use crate::shaper::ShaperConfig;
use crate::types::SimulationConfig;
use observability::HistogramConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8080";

/// UDP forwarding between clients and one upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSettings {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    /// A client silent for this long has its flows cancelled
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl ForwardSettings {
    pub fn new(listen_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            upstream_addr,
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShaperSettings {
    pub max_pending: usize,
    pub seed: Option<u64>,
    pub histogram_range_ms: u64,
    pub histogram_bucket_ms: u64,
}

impl Default for ShaperSettings {
    fn default() -> Self {
        let histogram = HistogramConfig::default();
        Self {
            max_pending: ShaperConfig::default().max_pending,
            seed: None,
            histogram_range_ms: histogram.range_ms,
            histogram_bucket_ms: histogram.bucket_ms,
        }
    }
}

impl ShaperSettings {
    pub fn shaper_config(&self) -> ShaperConfig {
        ShaperConfig {
            max_pending: self.max_pending,
            seed: self.seed,
        }
    }

    pub fn histogram_config(&self) -> HistogramConfig {
        HistogramConfig {
            range_ms: self.histogram_range_ms,
            bucket_ms: self.histogram_bucket_ms,
        }
    }
}

/// Everything the service needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    pub control_addr: SocketAddr,
    pub forward: Option<ForwardSettings>,
    pub shaper: ShaperSettings,
    /// Simulation parameters in force at startup
    pub initial: SimulationConfig,
    /// Periodically append snapshots here (`.csv` for CSV, JSON lines otherwise)
    pub stats_log: Option<PathBuf>,
    pub stats_log_interval_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            forward: None,
            shaper: ShaperSettings::default(),
            initial: SimulationConfig::default(),
            stats_log: None,
            stats_log_interval_ms: 1000,
        }
    }
}

impl ServiceSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_millis(self.stats_log_interval_ms)
    }

    /// Check everything that would otherwise fail after startup began
    pub fn validate(&self) -> Result<()> {
        self.initial.validate()?;

        if self.shaper.max_pending == 0 {
            return Err(SimError::InvalidSettings(
                "shaper.maxPending must be at least 1".to_string(),
            ));
        }
        self.shaper
            .histogram_config()
            .validate()
            .map_err(|e| SimError::InvalidSettings(format!("shaper histogram: {}", e)))?;

        if self.stats_log.is_some() && self.stats_log_interval_ms == 0 {
            return Err(SimError::InvalidSettings(
                "statsLogIntervalMs must be positive".to_string(),
            ));
        }

        if let Some(forward) = &self.forward {
            if forward.idle_timeout_ms == 0 {
                return Err(SimError::InvalidSettings(
                    "forward.idleTimeoutMs must be positive".to_string(),
                ));
            }
            if forward.listen_addr == forward.upstream_addr {
                return Err(SimError::InvalidSettings(format!(
                    "forward.listenAddr and forward.upstreamAddr are both {}",
                    forward.listen_addr
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.control_addr.to_string(), DEFAULT_CONTROL_ADDR);
        assert!(settings.initial.is_transparent());
        assert_eq!(settings.shaper.max_pending, 1024);
        assert_eq!(settings.shaper.histogram_config(), HistogramConfig::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let settings = ServiceSettings::from_json(
            r#"{
                "controlAddr": "0.0.0.0:9000",
                "forward": {"listenAddr": "127.0.0.1:5000", "upstreamAddr": "127.0.0.1:6000"},
                "shaper": {"seed": 7},
                "initial": {"baseLatencyMs": 25, "lossProbability": 0.1}
            }"#,
        )
        .unwrap();

        assert_eq!(settings.control_addr.port(), 9000);
        let forward = settings.forward.as_ref().unwrap();
        assert_eq!(forward.upstream_addr.port(), 6000);
        assert_eq!(forward.idle_timeout(), Duration::from_secs(30));
        assert_eq!(settings.shaper.seed, Some(7));
        assert_eq!(settings.shaper.max_pending, 1024);
        assert_eq!(settings.initial.base_latency_ms, 25.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = ServiceSettings::default();
        settings.initial.loss_probability = 2.0;
        assert!(matches!(settings.validate(), Err(SimError::Config(_))));

        let mut settings = ServiceSettings::default();
        settings.shaper.max_pending = 0;
        assert!(matches!(settings.validate(), Err(SimError::InvalidSettings(_))));

        let mut settings = ServiceSettings::default();
        settings.shaper.histogram_bucket_ms = 0;
        assert!(matches!(settings.validate(), Err(SimError::InvalidSettings(_))));

        let mut settings = ServiceSettings::default();
        settings.shaper.histogram_range_ms = 1_000_000_000_000;
        settings.shaper.histogram_bucket_ms = 1;
        assert!(matches!(settings.validate(), Err(SimError::InvalidSettings(_))));

        let mut settings = ServiceSettings::default();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        settings.forward = Some(ForwardSettings::new(addr, addr));
        assert!(matches!(settings.validate(), Err(SimError::InvalidSettings(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ServiceSettings::from_json("{\"controlAddr\": 8080}"),
            Err(SimError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"statsLog": "stats.csv", "statsLogIntervalMs": 500}"#).unwrap();

        let settings = ServiceSettings::from_file(&path).await.unwrap();
        assert_eq!(settings.stats_log, Some(PathBuf::from("stats.csv")));
        assert_eq!(settings.stats_log_interval(), Duration::from_millis(500));
    }
}
