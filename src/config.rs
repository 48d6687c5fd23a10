//! Process-wide store for the active simulation parameters

use crate::errors::ConfigError;
use crate::types::SimulationConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
struct Published {
    generation: u64,
    config: SimulationConfig,
}

/// Holds the active [`SimulationConfig`] behind a single atomic pointer
///
/// Readers load the whole value at once and never block; a replace validates
/// the candidate first and publishes it with one pointer swap, so a reader sees
/// either the previous config or the new one, never a mix.
#[derive(Debug)]
pub struct ConfigStore {
    active: ArcSwap<Published>,
}

impl ConfigStore {
    /// Create a store holding `initial`, which must itself be valid
    pub fn new(initial: SimulationConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            active: ArcSwap::from_pointee(Published {
                generation: 0,
                config: initial,
            }),
        })
    }

    /// The active config
    pub fn current(&self) -> SimulationConfig {
        self.active.load().config
    }

    /// The active config together with how many replaces produced it
    pub fn current_with_generation(&self) -> (u64, SimulationConfig) {
        let published = self.active.load();
        (published.generation, published.config)
    }

    pub fn generation(&self) -> u64 {
        self.active.load().generation
    }

    /// Validate and publish `candidate`; on error the active config is untouched
    pub fn replace(&self, candidate: SimulationConfig) -> Result<(), ConfigError> {
        candidate.validate()?;

        let previous = self.active.rcu(|current| {
            Arc::new(Published {
                generation: current.generation.wrapping_add(1),
                config: candidate,
            })
        });

        info!(
            generation = previous.generation.wrapping_add(1),
            "Simulation config replaced: {:?} -> {:?}",
            previous.config,
            candidate
        );
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            active: ArcSwap::from_pointee(Published {
                generation: 0,
                config: SimulationConfig::default(),
            }),
        }
    }
}
