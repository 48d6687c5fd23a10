//! Token bucket shared by every flow on the simulated link

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Longest wait a single reservation can be handed
pub const MAX_RESERVATION_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct BucketState {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl BucketState {
    fn refill(&mut self, rate: u64, now: Instant) {
        let capacity = rate as f64;
        if rate != self.rate {
            // Capacity follows the configured rate
            self.rate = rate;
            self.tokens = self.tokens.min(capacity);
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * capacity).min(capacity);
            self.last = now;
        }
    }
}

/// Byte budget refilled at the configured cap, capacity one second of traffic
///
/// Reservations may push the balance negative: each caller is told how long to
/// wait for its bytes rather than being refused, so concurrent flows queue
/// behind each other and the aggregate rate converges to the cap. The lock is
/// held only for the arithmetic; callers do their waiting elsewhere.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket for `rate` bytes per second
    pub fn new(rate: u64) -> Self {
        Self::new_at(rate, Instant::now())
    }

    pub fn new_at(rate: u64, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate as f64,
                last: now,
            }),
        }
    }

    /// Take `bytes` from the budget at `rate`, returning how long the caller must
    /// wait before they may be sent. A zero rate means unlimited.
    pub fn reserve(&self, bytes: usize, rate: u64, now: Instant) -> Duration {
        if rate == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        state.refill(rate, now);
        // Debt never exceeds what the link drains in the longest wait
        let max_debt = rate as f64 * MAX_RESERVATION_WAIT.as_secs_f64();
        state.tokens = (state.tokens - bytes as f64).max(-max_debt);
        let wait = if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-state.tokens / rate as f64)
                .map_or(MAX_RESERVATION_WAIT, |wait| wait.min(MAX_RESERVATION_WAIT))
        };
        drop(state);

        trace!(bytes, rate, ?wait, "Token bucket reservation");
        wait
    }

    /// Return bytes from a reservation that will never be sent
    pub fn refund(&self, bytes: usize) {
        let mut state = self.state.lock();
        let capacity = state.rate as f64;
        state.tokens = (state.tokens + bytes as f64).min(capacity);
    }

    /// Current balance after refilling up to `now`; negative while in debt
    pub fn balance(&self, rate: u64, now: Instant) -> f64 {
        let mut state = self.state.lock();
        state.refill(rate, now);
        state.tokens
    }
}
