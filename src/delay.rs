//! Per-unit delay, loss and reorder decisions

use crate::bucket::TokenBucket;
use crate::types::{Decision, FlowUnit, SimulationConfig};
use rand::Rng;
use rand_distr::{Distribution, Triangular};
use std::time::Duration;
use tracing::trace;

/// Draw a jitter offset in `[-jitter_ms, +jitter_ms]`, peaked at zero
pub fn sample_jitter<R: Rng + ?Sized>(rng: &mut R, jitter_ms: f64) -> f64 {
    if jitter_ms <= 0.0 {
        return 0.0;
    }
    match Triangular::new(-jitter_ms, jitter_ms, 0.0) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.gen_range(-jitter_ms..=jitter_ms),
    }
}

/// Milliseconds to a `Duration` at microsecond resolution; negatives clamp to zero
pub fn millis_to_duration(ms: f64) -> Duration {
    if ms <= 0.0 || !ms.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_micros((ms * 1000.0).round() as u64)
}

/// Decide the fate of one unit
///
/// RNG draws happen in a fixed order (loss, reorder, jitter), so a seeded
/// generator and the same sequence of units and configs reproduce the same
/// decisions. When a bandwidth cap is set, `link` is charged for the unit's
/// bytes as of its arrival time and any wait is added to the delay.
pub fn decide<P, R: Rng + ?Sized>(
    unit: &FlowUnit<P>,
    config: &SimulationConfig,
    rng: &mut R,
    link: &TokenBucket,
) -> Decision {
    let loss_roll: f64 = rng.gen();
    if loss_roll < config.loss_probability {
        trace!(seq = unit.sequence, "Decision: drop");
        return Decision::Drop;
    }

    let reorder_roll: f64 = rng.gen();
    let reorder = reorder_roll < config.reorder_probability;

    let offset = sample_jitter(rng, config.jitter_ms);
    // Reordered units skip the base latency and overtake whatever is in flight
    let latency_ms = if reorder {
        offset.max(0.0)
    } else {
        (config.base_latency_ms + offset).max(0.0)
    };

    let mut delay = millis_to_duration(latency_ms);
    if config.bandwidth_cap_bytes_per_sec > 0 {
        delay += link.reserve(
            unit.size_bytes,
            config.bandwidth_cap_bytes_per_sec,
            unit.arrival,
        );
    }

    trace!(seq = unit.sequence, reorder, ?delay, "Decision: deliver");
    if reorder {
        Decision::Reorder {
            delay,
            ahead_of_sequence: unit.sequence,
        }
    } else {
        Decision::Deliver(delay)
    }
}
