//! Traffic shaper: applies delay model decisions to live flows
//!
//! Every flow owns a bounded delay line ordered by computed delivery time and a
//! tokio task that sleeps until the earliest deadline, then hands due units to
//! the flow's downstream channel. All flows opened from one [`TrafficShaper`]
//! share its config store, token bucket and statistics, i.e. one simulated link.
//!
//! A unit moves through `Scheduled(deliver_at)` to exactly one terminal outcome:
//! delivered (in order or reordered), dropped by the loss model, force-dropped on
//! delay-line overflow, or cancelled with its flow. Only the first four are
//! counted as outcomes; cancelled units are tallied separately.

use crate::bucket::TokenBucket;
use crate::config::ConfigStore;
use crate::delay::decide;
use crate::errors::ShaperError;
use crate::types::{Decision, Delivered, FlowUnit, SimulationConfig};
use crate::StatsSnapshot;
use observability::StatsAggregator;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Shaper-wide settings fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShaperConfig {
    /// Most units a single flow may hold in its delay line
    pub max_pending: usize,
    /// Seed for per-flow RNGs; `None` draws from OS entropy
    pub seed: Option<u64>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            seed: None,
        }
    }
}

/// Per-flow outcome counts, returned when a flow ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSummary {
    pub id: u64,
    pub submitted: u64,
    pub delivered: u64,
    pub reordered: u64,
    pub dropped: u64,
    pub forced_drops: u64,
    pub cancelled: u64,
}

/// Where a flow is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Open with nothing in flight
    Idle,
    /// Open with the earliest pending delivery due at the given instant
    Scheduled(Instant),
    /// No further submissions; pending units still drain
    Closing,
    /// Torn down; pending units were discarded
    Cancelled,
}

#[derive(Debug)]
struct Scheduled<P> {
    unit: FlowUnit<P>,
    reordered: bool,
}

/// Pending units ordered by `(deliver_at, sequence)`, with an arrival-order index
/// for evicting the oldest
#[derive(Debug)]
struct DelayLine<P> {
    by_deadline: BTreeMap<(Instant, u64), Scheduled<P>>,
    by_sequence: BTreeMap<u64, Instant>,
}

impl<P> DelayLine<P> {
    fn new() -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            by_sequence: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.by_deadline.len()
    }

    fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    fn insert(&mut self, deliver_at: Instant, entry: Scheduled<P>) {
        let seq = entry.unit.sequence;
        self.by_sequence.insert(seq, deliver_at);
        self.by_deadline.insert((deliver_at, seq), entry);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: Instant) -> Vec<Scheduled<P>> {
        let mut due = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), scheduled) = entry.remove_entry();
            self.by_sequence.remove(&seq);
            due.push(scheduled);
        }
        due
    }

    fn evict_oldest(&mut self) -> Option<Scheduled<P>> {
        let (seq, deliver_at) = self.by_sequence.pop_first()?;
        self.by_deadline.remove(&(deliver_at, seq))
    }

    fn drain(&mut self) -> Vec<Scheduled<P>> {
        self.by_sequence.clear();
        std::mem::take(&mut self.by_deadline).into_values().collect()
    }
}

#[derive(Debug)]
struct FlowState<P> {
    line: DelayLine<P>,
    rng: StdRng,
    next_sequence: u64,
    closing: bool,
    cancelled: bool,
    summary: FlowSummary,
}

/// Everything a flow's task and handle share
struct FlowShared<P> {
    id: u64,
    max_pending: usize,
    config: Arc<ConfigStore>,
    link: Arc<TokenBucket>,
    stats: Arc<StatsAggregator>,
    state: Mutex<FlowState<P>>,
    wake: Notify,
}

impl<P> FlowShared<P> {
    fn submit(&self, size_bytes: usize, payload: P) -> Result<Decision, ShaperError> {
        let config: SimulationConfig = self.config.current();
        let mut state = self.state.lock();
        if state.cancelled || state.closing {
            return Err(ShaperError::FlowClosed(self.id));
        }

        let unit = FlowUnit::new(state.next_sequence, size_bytes, payload);
        state.next_sequence += 1;
        state.summary.submitted += 1;
        self.stats.record_submitted();

        let decision = decide(&unit, &config, &mut state.rng, &self.link);
        let delay = match decision.delay() {
            Some(delay) => delay,
            None => {
                state.summary.dropped += 1;
                self.stats.record_dropped();
                return Ok(decision);
            }
        };

        let deliver_at = match unit.arrival.checked_add(delay) {
            Some(at) => at,
            None => {
                debug!(
                    flow = self.id,
                    seq = unit.sequence,
                    ?delay,
                    "Delivery time out of range, dropping"
                );
                self.link.refund(unit.size_bytes);
                state.summary.forced_drops += 1;
                self.stats.record_enqueued();
                self.stats.record_forced_drop();
                return Ok(Decision::Drop);
            }
        };
        let was_earliest = state
            .line
            .next_deadline()
            .map_or(true, |next| deliver_at < next);
        state.line.insert(
            deliver_at,
            Scheduled {
                unit,
                reordered: decision.is_reorder(),
            },
        );
        self.stats.record_enqueued();

        if state.line.len() > self.max_pending {
            if let Some(evicted) = state.line.evict_oldest() {
                debug!(
                    flow = self.id,
                    seq = evicted.unit.sequence,
                    "{}",
                    ShaperError::CapacityExceeded(self.max_pending)
                );
                self.link.refund(evicted.unit.size_bytes);
                state.summary.forced_drops += 1;
                self.stats.record_forced_drop();
            }
        }
        drop(state);

        if was_earliest {
            self.wake.notify_one();
        }
        Ok(decision)
    }

    /// Discard everything pending, releasing bucket reservations. Returns the count.
    fn cancel_pending(&self) -> u64 {
        let mut state = self.state.lock();
        if state.cancelled {
            return 0;
        }
        state.cancelled = true;
        let discarded = state.line.drain();
        let count = discarded.len() as u64;
        state.summary.cancelled += count;
        drop(state);

        for entry in &discarded {
            self.link.refund(entry.unit.size_bytes);
        }
        self.stats.record_cancelled(count);
        debug!(flow = self.id, pending = count, "{}", ShaperError::CancelledFlow(self.id));
        self.wake.notify_one();
        count
    }

    fn status(&self) -> FlowStatus {
        let state = self.state.lock();
        if state.cancelled {
            FlowStatus::Cancelled
        } else if state.closing {
            FlowStatus::Closing
        } else {
            match state.line.next_deadline() {
                Some(at) => FlowStatus::Scheduled(at),
                None => FlowStatus::Idle,
            }
        }
    }

    /// Hand every due unit downstream; false once the consumer is gone
    fn release_due(&self, now: Instant, downstream: &mpsc::UnboundedSender<Delivered<P>>) -> bool {
        let due = self.state.lock().line.pop_due(now);
        let (mut delivered, mut reordered, mut cancelled) = (0u64, 0u64, 0u64);
        let mut consumer_gone = false;

        for Scheduled { unit, reordered: late } in due {
            if consumer_gone {
                cancelled += 1;
                continue;
            }
            let latency = now.saturating_duration_since(unit.arrival);
            let size = unit.size_bytes;
            let out = Delivered {
                sequence: unit.sequence,
                size_bytes: size,
                latency,
                reordered: late,
                payload: unit.payload,
            };
            if downstream.send(out).is_err() {
                consumer_gone = true;
                cancelled += 1;
                continue;
            }
            self.stats.record_delivered(latency, size as u64, late);
            if late {
                reordered += 1;
            } else {
                delivered += 1;
            }
        }

        if cancelled > 0 {
            self.stats.record_cancelled(cancelled);
        }
        let mut state = self.state.lock();
        state.summary.delivered += delivered;
        state.summary.reordered += reordered;
        state.summary.cancelled += cancelled;
        !consumer_gone
    }
}

async fn run_flow<P>(
    shared: Arc<FlowShared<P>>,
    downstream: mpsc::UnboundedSender<Delivered<P>>,
) -> FlowSummary
where
    P: Send + 'static,
{
    loop {
        // Registered before inspecting state so a submit in between is not missed
        let notified = shared.wake.notified();
        let deadline = {
            let state = shared.state.lock();
            if state.cancelled || (state.closing && state.line.is_empty()) {
                break;
            }
            state.line.next_deadline()
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(at) => {
                        if !shared.release_due(Instant::now(), &downstream) {
                            debug!(flow = shared.id, "Downstream closed, cancelling flow");
                            shared.cancel_pending();
                        }
                    }
                }
            }
            None => notified.await,
        }
    }

    shared.stats.flow_closed();
    let summary = shared.state.lock().summary;
    debug!(flow = shared.id, ?summary, "Flow finished");
    summary
}

/// One simulated link shared by any number of flows
pub struct TrafficShaper {
    config: Arc<ConfigStore>,
    link: Arc<TokenBucket>,
    stats: Arc<StatsAggregator>,
    settings: ShaperConfig,
    next_flow_id: AtomicU64,
}

impl TrafficShaper {
    pub fn new(
        config: Arc<ConfigStore>,
        stats: Arc<StatsAggregator>,
        settings: ShaperConfig,
    ) -> Self {
        let rate = config.current().bandwidth_cap_bytes_per_sec;
        Self {
            config,
            link: Arc::new(TokenBucket::new(rate)),
            stats,
            settings,
            next_flow_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn link(&self) -> &Arc<TokenBucket> {
        &self.link
    }

    pub fn settings(&self) -> ShaperConfig {
        self.settings
    }

    /// Coherent statistics with the active config echoed
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.config.current())
    }

    /// Open a flow; delivered units arrive on the returned receiver in
    /// computed-delivery-time order. Must be called inside a tokio runtime.
    pub fn open_flow<P>(&self) -> (FlowHandle<P>, mpsc::UnboundedReceiver<Delivered<P>>)
    where
        P: Send + 'static,
    {
        let id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };

        let shared = Arc::new(FlowShared {
            id,
            max_pending: self.settings.max_pending,
            config: self.config.clone(),
            link: self.link.clone(),
            stats: self.stats.clone(),
            state: Mutex::new(FlowState {
                line: DelayLine::new(),
                rng,
                next_sequence: 0,
                closing: false,
                cancelled: false,
                summary: FlowSummary {
                    id,
                    ..FlowSummary::default()
                },
            }),
            wake: Notify::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.stats.flow_opened();
        let task = tokio::spawn(run_flow(shared.clone(), tx));
        info!(flow = id, "Opened flow");

        (
            FlowHandle {
                shared,
                task: Some(task),
            },
            rx,
        )
    }
}

/// Owning handle of one flow; dropping it cancels the flow
pub struct FlowHandle<P> {
    shared: Arc<FlowShared<P>>,
    task: Option<JoinHandle<FlowSummary>>,
}

impl<P> FlowHandle<P> {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Submit one unit, returning the delay model's decision for it
    pub fn submit(&self, size_bytes: usize, payload: P) -> Result<Decision, ShaperError> {
        self.shared.submit(size_bytes, payload)
    }

    /// Units currently held in the delay line
    pub fn pending(&self) -> usize {
        self.shared.state.lock().line.len()
    }

    pub fn status(&self) -> FlowStatus {
        self.shared.status()
    }

    /// Outcome counts so far
    pub fn summary(&self) -> FlowSummary {
        self.shared.state.lock().summary
    }

    /// Stop accepting units and wait until everything pending is delivered
    pub async fn finish(mut self) -> FlowSummary {
        self.shared.state.lock().closing = true;
        self.shared.wake.notify_one();
        self.join().await
    }

    /// Tear the flow down now: pending deliveries are discarded, counted only as
    /// cancelled, and their bucket reservations released
    pub async fn cancel(mut self) -> FlowSummary {
        self.shared.cancel_pending();
        self.join().await
    }

    async fn join(&mut self) -> FlowSummary {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(summary) => summary,
                Err(_) => self.summary(),
            },
            None => self.summary(),
        }
    }
}

impl<P> Drop for FlowHandle<P> {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shared.cancel_pending();
        }
    }
}
