//! Network condition simulator service
//!
//! Serves the `/stats` and `/config` control surface and, when a forward
//! target is configured, shapes UDP traffic between clients and that target.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use lagsim::forwarder::UdpForwarder;
use lagsim::presets::{self, PRESETS};
use lagsim::settings::ForwardSettings;
use lagsim::{ConfigStore, ControlServer, ControlState, ServiceSettings, TrafficShaper};
use observability::{init_logging, LogConfig, StatsAggregator, StatsRecorder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulator
    Serve {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Exit after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },

    /// List built-in link presets
    Presets,

    /// Print the effective settings as JSON and exit
    Settings {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// JSON settings file; flags below override it
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Start from a named preset (see `presets`)
    #[arg(long)]
    preset: Option<String>,

    /// Address for the /stats and /config endpoints
    #[arg(long)]
    control_addr: Option<SocketAddr>,

    /// UDP address clients send to
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// UDP address traffic is forwarded to
    #[arg(long)]
    upstream: Option<SocketAddr>,

    /// Cancel a client's flows after this much silence
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Seed per-flow RNGs for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Delay-line bound per flow
    #[arg(long)]
    max_pending: Option<usize>,

    /// Record snapshots to this file (.csv or JSON lines)
    #[arg(long)]
    stats_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig {
        verbose: cli.verbose,
        json: cli.log_json,
    })?;

    match cli.command {
        Commands::Serve { settings, duration } => {
            let settings = resolve_settings(settings).await?;
            cmd_serve(settings, duration).await?;
        }
        Commands::Presets => cmd_presets(),
        Commands::Settings { settings } => {
            let settings = resolve_settings(settings).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

/// Settings file, then preset, then individual flags
async fn resolve_settings(args: SettingsArgs) -> Result<ServiceSettings> {
    let mut settings = match &args.settings {
        Some(path) => ServiceSettings::from_file(path)
            .await
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ServiceSettings::default(),
    };

    if let Some(name) = &args.preset {
        settings.initial = presets::by_name(name)?.config;
    }
    if let Some(addr) = args.control_addr {
        settings.control_addr = addr;
    }

    if args.listen.is_some() || args.upstream.is_some() {
        let forward = match (settings.forward.take(), args.listen, args.upstream) {
            (Some(mut forward), listen, upstream) => {
                forward.listen_addr = listen.unwrap_or(forward.listen_addr);
                forward.upstream_addr = upstream.unwrap_or(forward.upstream_addr);
                forward
            }
            (None, Some(listen), Some(upstream)) => ForwardSettings::new(listen, upstream),
            (None, _, _) => bail!("--listen and --upstream must be given together"),
        };
        settings.forward = Some(forward);
    }
    if let Some(ms) = args.idle_timeout_ms {
        match settings.forward.as_mut() {
            Some(forward) => forward.idle_timeout_ms = ms,
            None => bail!("--idle-timeout-ms needs a forward target"),
        }
    }

    if args.seed.is_some() {
        settings.shaper.seed = args.seed;
    }
    if let Some(max_pending) = args.max_pending {
        settings.shaper.max_pending = max_pending;
    }
    if args.stats_log.is_some() {
        settings.stats_log = args.stats_log;
    }

    settings.validate()?;
    Ok(settings)
}

fn cmd_presets() {
    println!("Built-in presets:");
    for preset in PRESETS {
        let c = &preset.config;
        println!(
            "  {:<10} {} (latency {}ms ±{}ms, loss {}%, reorder {}%, cap {})",
            preset.name,
            preset.description,
            c.base_latency_ms,
            c.jitter_ms,
            c.loss_probability * 100.0,
            c.reorder_probability * 100.0,
            if c.bandwidth_cap_bytes_per_sec == 0 {
                "unlimited".to_string()
            } else {
                format!("{} B/s", c.bandwidth_cap_bytes_per_sec)
            }
        );
    }
}

async fn cmd_serve(settings: ServiceSettings, duration: Option<u64>) -> Result<()> {
    let stats = Arc::new(StatsAggregator::new(settings.shaper.histogram_config())?);
    let config = Arc::new(ConfigStore::new(settings.initial)?);
    let shaper = Arc::new(TrafficShaper::new(
        config.clone(),
        stats.clone(),
        settings.shaper.shaper_config(),
    ));

    let server = ControlServer::new(
        settings.control_addr,
        ControlState::new(config.clone(), stats.clone()),
    )
    .start()
    .await?;
    info!("Control surface at http://{}", server.local_addr());

    let mut forwarder = match &settings.forward {
        Some(forward) => {
            let mut forwarder = UdpForwarder::new(forward.clone(), shaper.clone());
            forwarder.start().await?;
            Some(forwarder)
        }
        None => None,
    };

    let recorder = settings.stats_log.as_ref().map(|path| {
        let shaper = shaper.clone();
        StatsRecorder::new(path).spawn(settings.stats_log_interval(), move || shaper.snapshot())
    });

    let run_for = async {
        match duration {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = run_for => info!("Duration completed"),
        _ = signal::ctrl_c() => info!("Interrupted by user"),
    }

    if let Some(forwarder) = forwarder.as_mut() {
        forwarder.stop().await;
    }
    if let Some(recorder) = recorder {
        let written = recorder.stop().await;
        info!("Recorded {} stats snapshots", written);
    }
    server.shutdown().await;

    let snapshot = shaper.snapshot();
    info!(
        submitted = snapshot.submitted,
        delivered = snapshot.delivered,
        reordered = snapshot.reordered,
        dropped = snapshot.dropped,
        forced_drops = snapshot.forced_drops,
        cancelled = snapshot.cancelled,
        "Simulator shut down"
    );
    Ok(())
}
