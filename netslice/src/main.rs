//! The netslice operator binary.
//!
//! ```bash
//! netslice --config /etc/netslice.json up --watch 10
//! netslice qos apply --dev br-netslice --bandwidth 10 --latency 50
//! netslice qos verify --dev br-netslice --bandwidth 10 --latency 50 --json
//! netslice nat ensure --subnet 10.50.120.0/24
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use netslice::{
    identity::StaticIdentityProvider,
    model::SliceId,
    net::{NatConfigurator, Subnet, UpstreamResolver},
    orchestrator::{render_text, InspectFilter},
    qos::{QosShaper, ShaperOptions, ShapingProfile},
    shell::{RunnerOptions, Shell},
    Netslice, NetsliceConfig,
};
use tokio::time::Interval;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "netslice", version, about = "Bandwidth and latency bounded network slices", long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults are used when unset.
    #[arg(long, global = true, env = "NETSLICE_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the configured slices and keep them up until Ctrl-C.
    Up(UpArgs),
    /// Shape a single interface.
    Qos {
        #[command(subcommand)]
        action: QosCommand,
    },
    /// Manage source NAT.
    Nat {
        #[command(subcommand)]
        action: NatCommand,
    },
}

#[derive(Args)]
struct UpArgs {
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
    /// Include terminal slices in the report.
    #[arg(long)]
    all: bool,
    /// Only report this slice.
    #[arg(long)]
    slice_id: Option<SliceId>,
    /// Print the report again every this many seconds.
    #[arg(long, value_name = "SECS")]
    watch: Option<u64>,
}

#[derive(Args)]
struct ShapeArgs {
    #[arg(long)]
    dev: String,
    /// Bandwidth cap in Mbit/s.
    #[arg(long, value_parser = parse_bandwidth)]
    bandwidth: f64,
    /// Added delay in ms.
    #[arg(long)]
    latency: u32,
}

#[derive(Subcommand)]
enum QosCommand {
    /// Install the shaping tree.
    Apply(ShapeArgs),
    /// Compare the live shaping with the expected values.
    Verify {
        #[command(flatten)]
        shape: ShapeArgs,
        #[arg(long)]
        json: bool,
    },
    /// Remove the shaping tree.
    Remove {
        #[arg(long)]
        dev: String,
    },
}

#[derive(Subcommand)]
enum NatCommand {
    /// Enable forwarding and install the NAT rules of a subnet.
    Ensure {
        #[arg(long)]
        subnet: Subnet,
        /// Auto-detected if unset.
        #[arg(long)]
        upstream: Option<String>,
    },
}

fn parse_bandwidth(s: &str) -> std::result::Result<f64, String> {
    let bandwidth: f64 = s.parse().map_err(|e| format!("{e}"))?;
    ShapingProfile::new(bandwidth, 0).validate().map_err(|e| e.to_string())?;
    Ok(bandwidth)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => NetsliceConfig::load(path)?,
        None => {
            tracing::info!("no configuration given, using defaults");
            NetsliceConfig::default()
        }
    };
    let shell = Shell::system(RunnerOptions::default().with_sudo(config.shell.sudo));

    match cli.command {
        Command::Up(args) => up(&config, args).await,
        Command::Qos { action } => qos(&config, shell, action).await,
        Command::Nat { action: NatCommand::Ensure { subnet, upstream } } => {
            let upstream = match upstream {
                Some(upstream) => upstream,
                None => UpstreamResolver::new(shell.clone(), config.upstream_interface.clone()).resolve().await,
            };
            let added = NatConfigurator::new(shell).ensure_nat(&subnet, &upstream).await?;
            println!("nat for {subnet} via {upstream}: {added} rules added");
            Ok(())
        }
    }
}

async fn up(config: &NetsliceConfig, args: UpArgs) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting netslice");

    let netslice = Netslice::system(config, Arc::new(StaticIdentityProvider::new())).await?;
    let orchestrator = &netslice.orchestrator;

    for spec in &config.slices {
        let slice = orchestrator.create(spec.clone()).await?;
        let slice = orchestrator.wait_settled(slice.id).await?;
        match &slice.failure_reason {
            Some(reason) => tracing::error!(name = %slice.name, %reason, "slice failed"),
            None => tracing::info!(name = %slice.name, state = %slice.state, "slice settled"),
        }
    }

    let filter = match args.slice_id {
        Some(id) => InspectFilter::slice(id),
        None => InspectFilter { all: args.all, slice_id: None },
    };

    let mut sweep = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    let mut watch = args.watch.map(|secs| tokio::time::interval(Duration::from_secs(secs.max(1))));

    print_report(&netslice, &filter, args.json).await?;
    if let Some(watch) = &mut watch {
        // The first tick completes immediately.
        watch.tick().await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sweep.tick() => {
                if let Err(e) = netslice.sessions.expire_sessions(Utc::now()).await {
                    tracing::warn!(error = %e, "session sweep failed");
                }
            }
            () = next_tick(&mut watch) => {
                print_report(&netslice, &filter, args.json).await?;
            }
        }
    }

    tracing::info!("shutting down");
    for (id, report) in orchestrator.shutdown().await? {
        for issue in report.issues() {
            eprintln!("slice {id}: teardown incomplete: {issue}");
        }
    }

    Ok(())
}

/// Waits for the next tick, or forever without an interval.
async fn next_tick(watch: &mut Option<Interval>) {
    match watch {
        Some(watch) => {
            watch.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn print_report(netslice: &Netslice, filter: &InspectFilter, json: bool) -> Result<()> {
    let reports = netslice.orchestrator.inspect(filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print!("{}", render_text(&reports));
    }
    Ok(())
}

async fn qos(config: &NetsliceConfig, shell: Shell, action: QosCommand) -> Result<()> {
    let shaper = QosShaper::new(shell, ShaperOptions::default().with_queue_latency_ms(config.qos.queue_latency_ms));

    match action {
        QosCommand::Apply(ShapeArgs { dev, bandwidth, latency }) => {
            let profile = shaper.apply(&dev, bandwidth, latency).await?;
            println!("{dev}: {profile:?}");
        }
        QosCommand::Verify { shape: ShapeArgs { dev, bandwidth, latency }, json } => {
            let verification = shaper.verify(&dev, bandwidth, latency).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&verification)?);
            } else {
                println!("{dev}: {}", if verification.verified { "verified" } else { "not verified" });
                for issue in &verification.issues {
                    println!("  ! {issue}");
                }
            }
            if !verification.verified {
                std::process::exit(1);
            }
        }
        QosCommand::Remove { dev } => {
            shaper.remove(&dev).await?;
            println!("{dev}: shaping removed");
        }
    }

    Ok(())
}
