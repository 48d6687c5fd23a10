//! Traffic statistics aggregation for the shaping engine

use crate::histogram::{HistogramBucket, HistogramConfig, LatencyHistogram};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Throughput is re-estimated at most this often; faster readers see the last estimate.
const MIN_THROUGHPUT_WINDOW: Duration = Duration::from_millis(250);

pub(crate) fn saturating_add(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(n))
    });
}

pub(crate) fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

/// Point-in-time copy of the aggregated statistics
///
/// `C` is the echo of the simulation parameters active when the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot<C> {
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,

    // Terminal outcomes (disjoint)
    pub delivered: u64,
    pub dropped: u64,
    pub reordered: u64,
    pub forced_drops: u64,

    pub submitted: u64,
    pub cancelled: u64,
    pub bytes_delivered: u64,

    // Gauges
    pub pending: u64,
    pub active_flows: u64,

    pub latency_histogram_ms: Vec<HistogramBucket>,
    pub throughput_bytes_per_sec: f64,
    pub active_config: C,
}

impl<C> StatsSnapshot<C> {
    /// Units handed downstream, in order or not
    pub fn total_delivered(&self) -> u64 {
        self.delivered.saturating_add(self.reordered)
    }

    /// Units removed from the link without delivery
    pub fn total_dropped(&self) -> u64 {
        self.dropped.saturating_add(self.forced_drops)
    }
}

impl<C: Serialize> StatsSnapshot<C> {
    pub fn to_json_line(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug)]
struct ThroughputEstimator {
    last_at: Instant,
    last_bytes: u64,
    estimate: f64,
}

impl ThroughputEstimator {
    fn new(now: Instant) -> Self {
        Self {
            last_at: now,
            last_bytes: 0,
            estimate: 0.0,
        }
    }

    fn observe(&mut self, now: Instant, bytes: u64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed >= MIN_THROUGHPUT_WINDOW {
            let delta = bytes.saturating_sub(self.last_bytes);
            self.estimate = delta as f64 / elapsed.as_secs_f64();
            self.last_at = now;
            self.last_bytes = bytes;
        }
        self.estimate
    }
}

/// Concurrently updated counters and latency histogram for one simulated link
///
/// Every record call performs its field updates while holding the shared side of
/// `gate`; [`StatsAggregator::snapshot`] reads under the exclusive side. A snapshot
/// therefore never observes half of a multi-field update, while concurrent
/// recorders only contend on atomic increments.
#[derive(Debug)]
pub struct StatsAggregator {
    gate: RwLock<()>,

    submitted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    reordered: AtomicU64,
    forced_drops: AtomicU64,
    cancelled: AtomicU64,
    bytes_delivered: AtomicU64,

    pending: AtomicU64,
    active_flows: AtomicU64,

    histogram: LatencyHistogram,
    throughput: Mutex<ThroughputEstimator>,
    started: Instant,
}

impl StatsAggregator {
    pub fn new(histogram: HistogramConfig) -> Result<Self> {
        Ok(Self::with_histogram(LatencyHistogram::new(histogram)?))
    }

    fn with_histogram(histogram: LatencyHistogram) -> Self {
        let now = Instant::now();
        Self {
            gate: RwLock::new(()),
            submitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reordered: AtomicU64::new(0),
            forced_drops: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            active_flows: AtomicU64::new(0),
            histogram,
            throughput: Mutex::new(ThroughputEstimator::new(now)),
            started: now,
        }
    }

    pub fn histogram_config(&self) -> HistogramConfig {
        self.histogram.config()
    }

    /// A unit entered the link
    pub fn record_submitted(&self) {
        let _g = self.gate.read();
        saturating_add(&self.submitted, 1);
    }

    /// A unit was lost to the probabilistic loss model
    pub fn record_dropped(&self) {
        let _g = self.gate.read();
        saturating_add(&self.dropped, 1);
    }

    /// A unit was placed in a delay line
    pub fn record_enqueued(&self) {
        let _g = self.gate.read();
        saturating_add(&self.pending, 1);
    }

    /// A pending unit was handed downstream
    pub fn record_delivered(&self, latency: Duration, bytes: u64, reordered: bool) {
        let _g = self.gate.read();
        saturating_sub(&self.pending, 1);
        if reordered {
            saturating_add(&self.reordered, 1);
        } else {
            saturating_add(&self.delivered, 1);
        }
        saturating_add(&self.bytes_delivered, bytes);
        self.histogram.record(latency);
    }

    /// A pending unit was evicted because its delay line was full
    pub fn record_forced_drop(&self) {
        let _g = self.gate.read();
        saturating_sub(&self.pending, 1);
        saturating_add(&self.forced_drops, 1);
    }

    /// Pending units were discarded by flow teardown
    pub fn record_cancelled(&self, count: u64) {
        if count == 0 {
            return;
        }
        let _g = self.gate.read();
        saturating_sub(&self.pending, count);
        saturating_add(&self.cancelled, count);
    }

    pub fn flow_opened(&self) {
        let _g = self.gate.read();
        saturating_add(&self.active_flows, 1);
    }

    pub fn flow_closed(&self) {
        let _g = self.gate.read();
        saturating_sub(&self.active_flows, 1);
    }

    /// Zero every counter and the histogram; gauges are left untouched
    pub fn reset(&self) {
        let _g = self.gate.write();
        for counter in [
            &self.submitted,
            &self.delivered,
            &self.dropped,
            &self.reordered,
            &self.forced_drops,
            &self.cancelled,
            &self.bytes_delivered,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.histogram.reset();
        *self.throughput.lock() = ThroughputEstimator::new(Instant::now());
    }

    /// Take a coherent copy of every counter, echoing `active_config`
    pub fn snapshot<C>(&self, active_config: C) -> StatsSnapshot<C> {
        let now = Instant::now();
        let (counts, latency_histogram_ms) = {
            let _g = self.gate.write();
            let counts = [
                self.submitted.load(Ordering::Relaxed),
                self.delivered.load(Ordering::Relaxed),
                self.dropped.load(Ordering::Relaxed),
                self.reordered.load(Ordering::Relaxed),
                self.forced_drops.load(Ordering::Relaxed),
                self.cancelled.load(Ordering::Relaxed),
                self.bytes_delivered.load(Ordering::Relaxed),
                self.pending.load(Ordering::Relaxed),
                self.active_flows.load(Ordering::Relaxed),
            ];
            (counts, self.histogram.buckets())
        };
        let [submitted, delivered, dropped, reordered, forced_drops, cancelled, bytes_delivered, pending, active_flows] =
            counts;

        let throughput_bytes_per_sec = self.throughput.lock().observe(now, bytes_delivered);

        StatsSnapshot {
            timestamp: Utc::now(),
            uptime_ms: u64::try_from(now.saturating_duration_since(self.started).as_millis())
                .unwrap_or(u64::MAX),
            delivered,
            dropped,
            reordered,
            forced_drops,
            submitted,
            cancelled,
            bytes_delivered,
            pending,
            active_flows,
            latency_histogram_ms,
            throughput_bytes_per_sec,
            active_config,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::with_histogram(LatencyHistogram::default())
    }
}
