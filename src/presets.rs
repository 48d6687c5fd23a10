//! Named link presets
//!
//! Values are typical one-way figures for each kind of link, not measurements
//! of any particular network.

use crate::errors::SimError;
use crate::types::SimulationConfig;

/// A named, ready-made [`SimulationConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub config: SimulationConfig,
}

const fn link(
    base_latency_ms: f64,
    jitter_ms: f64,
    loss_probability: f64,
    bandwidth_cap_bytes_per_sec: u64,
    reorder_probability: f64,
) -> SimulationConfig {
    SimulationConfig {
        base_latency_ms,
        jitter_ms,
        loss_probability,
        bandwidth_cap_bytes_per_sec,
        reorder_probability,
    }
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "perfect",
        description: "Transparent link, no effect on traffic",
        config: link(0.0, 0.0, 0.0, 0, 0.0),
    },
    Preset {
        name: "lan",
        description: "Wired LAN: sub-millisecond latency, gigabit",
        config: link(0.5, 0.1, 0.0, 125_000_000, 0.0),
    },
    Preset {
        name: "wifi",
        description: "Home Wi-Fi with moderate jitter",
        config: link(3.0, 4.0, 0.005, 6_250_000, 0.001),
    },
    Preset {
        name: "cellular",
        description: "4G/LTE mobile link",
        config: link(50.0, 20.0, 0.01, 2_500_000, 0.005),
    },
    Preset {
        name: "satellite",
        description: "Geostationary satellite hop",
        config: link(300.0, 30.0, 0.01, 1_250_000, 0.0),
    },
    Preset {
        name: "congested",
        description: "Overloaded shared uplink",
        config: link(150.0, 50.0, 0.03, 125_000, 0.02),
    },
    Preset {
        name: "lossy",
        description: "Heavy random loss and reordering",
        config: link(80.0, 40.0, 0.15, 0, 0.05),
    },
];

/// Look up a preset by name, case-insensitively
pub fn by_name(name: &str) -> Result<&'static Preset, SimError> {
    PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| SimError::UnknownPreset(name.to_string()))
}

pub fn names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_validate() {
        for preset in PRESETS {
            assert!(
                preset.config.validate().is_ok(),
                "preset {} is invalid",
                preset.name
            );
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(by_name("satellite").unwrap().config.base_latency_ms, 300.0);
        assert_eq!(by_name("WiFi").unwrap().name, "wifi");
        assert!(by_name("perfect").unwrap().config.is_transparent());
        assert!(matches!(by_name("dialup"), Err(SimError::UnknownPreset(n)) if n == "dialup"));
    }

    #[test]
    fn test_names_unique() {
        let mut all: Vec<_> = names().collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }
}
