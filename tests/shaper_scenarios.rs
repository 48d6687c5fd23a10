//! End-to-end shaping scenarios on a paused clock
//!
//! Time only advances while every task is waiting on a timer, so delays are
//! exact and multi-second scenarios finish instantly.

use anyhow::Result;
use lagsim::{ConfigStore, Decision, ShaperConfig, SimulationConfig, TrafficShaper};
use observability::StatsAggregator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn shaper(config: SimulationConfig, seed: u64) -> Result<TrafficShaper> {
    Ok(TrafficShaper::new(
        Arc::new(ConfigStore::new(config)?),
        Arc::new(StatsAggregator::default()),
        ShaperConfig {
            max_pending: 1024,
            seed: Some(seed),
        },
    ))
}

fn near(actual: Duration, expected: Duration) -> bool {
    actual >= expected && actual < expected + Duration::from_millis(1)
}

#[tokio::test(start_paused = true)]
async fn test_fixed_latency_preserves_order() -> Result<()> {
    let shaper = shaper(SimulationConfig::default().with_latency(100.0, 0.0), 1)?;
    let (flow, mut rx) = shaper.open_flow::<u32>();

    for i in 0..10 {
        flow.submit(100, i)?;
        sleep(Duration::from_millis(1)).await;
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        let unit = rx.recv().await.expect("delivery");
        assert!(
            near(unit.latency, Duration::from_millis(100)),
            "latency {:?}",
            unit.latency
        );
        assert!(!unit.reordered);
        received.push(unit.payload);
    }
    assert_eq!(received, (0..10).collect::<Vec<_>>());

    let summary = flow.finish().await;
    assert_eq!(summary.delivered, 10);
    assert_eq!(shaper.snapshot().delivered, 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_jitter_keeps_delay_in_bounds() -> Result<()> {
    let shaper = shaper(SimulationConfig::default().with_latency(50.0, 10.0), 9)?;
    let (flow, mut rx) = shaper.open_flow::<()>();

    for _ in 0..200 {
        flow.submit(64, ())?;
    }
    let summary = flow.finish().await;
    assert_eq!(summary.delivered, 200);

    let mut last = Duration::ZERO;
    while let Some(unit) = rx.recv().await {
        assert!(unit.latency >= Duration::from_millis(40));
        assert!(unit.latency <= Duration::from_millis(61));
        // Delivered in computed-delivery-time order
        assert!(unit.latency >= last);
        last = unit.latency;
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_half_loss_is_binomial() -> Result<()> {
    let shaper = shaper(SimulationConfig::default().with_loss(0.5), 1234)?;
    let (flow, _rx) = shaper.open_flow::<()>();

    for _ in 0..1000 {
        flow.submit(10, ())?;
    }
    let summary = flow.finish().await;

    // n=1000, p=0.5: sigma ~15.8, allow 5 sigma
    assert!(
        (421..=579).contains(&summary.delivered),
        "delivered {}",
        summary.delivered
    );
    assert_eq!(summary.delivered + summary.dropped, 1000);

    let snap = shaper.snapshot();
    assert_eq!(snap.submitted, 1000);
    assert_eq!(snap.delivered + snap.dropped, 1000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_total_loss_delivers_nothing() -> Result<()> {
    let shaper = shaper(SimulationConfig::default().with_loss(1.0).with_latency(10.0, 0.0), 5)?;
    let (flow, mut rx) = shaper.open_flow::<()>();

    for _ in 0..500 {
        assert_eq!(flow.submit(10, ())?, Decision::Drop);
    }
    flow.finish().await;
    assert!(rx.recv().await.is_none());

    let snap = shaper.snapshot();
    assert_eq!(snap.dropped, 500);
    assert_eq!(snap.delivered, 0);
    assert_eq!(snap.reordered, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_pending_units() -> Result<()> {
    let config = SimulationConfig::default()
        .with_latency(100.0, 0.0)
        .with_bandwidth_cap(10_000);
    let shaper = shaper(config, 3)?;
    let start = Instant::now();
    let (flow, mut rx) = shaper.open_flow::<u32>();

    for i in 0..5 {
        flow.submit(3_000, i)?;
    }
    assert_eq!(flow.pending(), 5);
    // 15 000 bytes against a 10 000 byte bucket
    assert!(shaper.link().balance(10_000, start) < 0.0);

    sleep(Duration::from_millis(50)).await;
    let summary = flow.cancel().await;
    assert_eq!(summary.cancelled, 5);
    assert_eq!(summary.delivered, 0);
    assert!(rx.recv().await.is_none());

    let snap = shaper.snapshot();
    assert_eq!(snap.cancelled, 5);
    assert_eq!(snap.delivered, 0);
    assert_eq!(snap.dropped, 0);
    assert_eq!(snap.forced_drops, 0);
    assert_eq!(snap.pending, 0);
    assert_eq!(snap.active_flows, 0);
    // Reservations returned
    assert_eq!(shaper.link().balance(10_000, Instant::now()), 10_000.0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reordered_unit_overtakes() -> Result<()> {
    let shaper = shaper(SimulationConfig::default().with_latency(100.0, 0.0), 8)?;
    let (flow, mut rx) = shaper.open_flow::<&'static str>();

    flow.submit(10, "first")?;
    shaper
        .config()
        .replace(SimulationConfig::default().with_latency(100.0, 0.0).with_reorder(1.0))?;
    let decision = flow.submit(10, "second")?;
    assert_eq!(
        decision,
        Decision::Reorder {
            delay: Duration::ZERO,
            ahead_of_sequence: 1
        }
    );

    let a = rx.recv().await.expect("delivery");
    let b = rx.recv().await.expect("delivery");
    assert_eq!((a.payload, a.reordered), ("second", true));
    assert_eq!((b.payload, b.reordered), ("first", false));
    assert_eq!(a.sequence, 1);

    let snap = shaper.snapshot();
    assert_eq!(snap.reordered, 1);
    assert_eq!(snap.delivered, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bandwidth_cap_shared_across_flows() -> Result<()> {
    const CAP: u64 = 10_000;
    const UNIT: usize = 1_000;
    let shaper = shaper(SimulationConfig::default().with_bandwidth_cap(CAP), 21)?;

    let mut flows = Vec::new();
    for _ in 0..4 {
        flows.push(shaper.open_flow::<usize>());
    }
    for i in 0..50 {
        for (flow, _) in &flows {
            flow.submit(UNIT, i)?;
        }
    }

    let mut receivers = Vec::new();
    for (flow, rx) in flows {
        let summary = flow.finish().await;
        assert_eq!(summary.delivered, 50);
        receivers.push(rx);
    }

    let mut deliveries = Vec::new();
    for mut rx in receivers {
        let mut flow_last = Duration::ZERO;
        while let Some(unit) = rx.recv().await {
            flow_last = flow_last.max(unit.latency);
            deliveries.push(unit.latency);
        }
        // Round-robin submission shares the link evenly: every flow finishes near the end
        assert!(flow_last >= Duration::from_secs(18), "flow done at {:?}", flow_last);
    }
    assert_eq!(deliveries.len(), 200);
    deliveries.sort();

    // Never more than one bucket of burst plus the cap over any prefix window
    for (k, at) in deliveries.iter().enumerate() {
        let bytes = ((k + 1) * UNIT) as f64;
        let allowed = CAP as f64 * (1.0 + at.as_secs_f64()) + 1.0;
        assert!(bytes <= allowed, "{} bytes by {:?}", bytes, at);
    }

    // 200 kB at 10 kB/s with a 10 kB head start
    let last = deliveries[deliveries.len() - 1];
    assert!(last >= Duration::from_secs(19) && last < Duration::from_millis(19_010));
    let rate = (200 * UNIT) as f64 / last.as_secs_f64();
    assert!(rate <= CAP as f64 * 1.06, "aggregate rate {}", rate);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_seeded_flows_reproduce() -> Result<()> {
    let config = SimulationConfig::default()
        .with_latency(30.0, 20.0)
        .with_loss(0.2)
        .with_reorder(0.1);

    async fn run(config: SimulationConfig) -> Result<Vec<Decision>> {
        let shaper = shaper(config, 77)?;
        let (flow, _rx) = shaper.open_flow::<()>();
        let mut decisions = Vec::new();
        for _ in 0..300 {
            decisions.push(flow.submit(100, ())?);
        }
        flow.cancel().await;
        Ok(decisions)
    }

    assert_eq!(run(config).await?, run(config).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_delay_line_bound_forces_drops() -> Result<()> {
    let shaper = TrafficShaper::new(
        Arc::new(ConfigStore::new(SimulationConfig::default().with_latency(200.0, 0.0))?),
        Arc::new(StatsAggregator::default()),
        ShaperConfig {
            max_pending: 8,
            seed: Some(2),
        },
    );
    let (flow, mut rx) = shaper.open_flow::<u32>();
    for i in 0..20 {
        flow.submit(10, i)?;
    }
    let summary = flow.finish().await;
    assert_eq!(summary.forced_drops, 12);
    assert_eq!(summary.delivered, 8);

    let mut first = None;
    while let Some(unit) = rx.recv().await {
        first.get_or_insert(unit.payload);
    }
    // Oldest units were evicted
    assert_eq!(first, Some(12));

    let snap = shaper.snapshot();
    assert_eq!(snap.forced_drops, 12);
    assert_eq!(snap.dropped, 0);
    Ok(())
}
