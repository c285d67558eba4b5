//! vmscaled: the vmscale daemon.
//!
//! Assembles the scaling subsystems into one process:
//! - Resource pool and decision lock (redb)
//! - Template catalog and policy (vmscale.toml)
//! - Scale-in and scale-out deciders
//! - Spool-directory provision sink
//!
//! # Usage
//!
//! ```text
//! vmscaled run --config /etc/vmscale.toml --data-dir /var/lib/vmscale --interval 30
//! vmscaled once --config /etc/vmscale.toml --data-dir /var/lib/vmscale
//! vmscaled check-config --config /etc/vmscale.toml
//! ```

mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmscale_autoscale::{ControlLoop, ScaleInDecider, ScaleOutDecider};
use vmscale_core::ScalerConfig;
use vmscale_state::{Exclusive, ResourcePool, StateStore};

use crate::sink::SpoolSink;

const DEFAULT_LOG_FILTER: &str = "info,vmscaled=debug,vmscale_autoscale=debug,vmscale_state=debug";

#[derive(Parser)]
#[command(name = "vmscaled", about = "vmscale autoscaler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        #[command(flatten)]
        opts: DaemonOpts,

        /// Seconds between cycles.
        #[arg(long, default_value = "30")]
        interval: u64,
    },
    /// Run a single cycle and print its report as JSON.
    Once {
        #[command(flatten)]
        opts: DaemonOpts,
    },
    /// Validate a config file and list its templates.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct DaemonOpts {
    /// Path to vmscale.toml.
    #[arg(long)]
    config: PathBuf,

    /// Data directory for the state store.
    #[arg(long, default_value = "/var/lib/vmscale")]
    data_dir: PathBuf,

    /// Where provision requests are written. Defaults to `<data-dir>/spool`.
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Lock holder prefix for this instance. Defaults to `$HOSTNAME`.
    #[arg(long)]
    holder: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `once` can print its report on stdout.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Command::Run { opts, interval } => run(opts, interval).await,
        Command::Once { opts } => once(opts).await,
        Command::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ScalerConfig> {
    ScalerConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn assemble(opts: DaemonOpts) -> anyhow::Result<ControlLoop> {
    let config = Arc::new(load_config(&opts.config)?);
    info!(templates = config.catalog.len(), "configuration loaded");

    std::fs::create_dir_all(&opts.data_dir)?;
    let db_path = opts.data_dir.join("vmscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let spool_dir = opts
        .spool_dir
        .unwrap_or_else(|| opts.data_dir.join("spool"));
    let sink = Arc::new(SpoolSink::new(spool_dir)?);
    info!(dir = %sink.dir().display(), "provision spool ready");

    let holder = opts.holder.unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| format!("vmscaled-{}", std::process::id()))
    });
    let exclusive = Exclusive::new(Arc::new(store.clone()), holder, config.policy.lock_ttl);
    let pool: Arc<dyn ResourcePool> = Arc::new(store);

    Ok(ControlLoop::new(
        pool.clone(),
        ScaleInDecider::new(pool.clone(), exclusive.clone(), config.clone()),
        ScaleOutDecider::new(pool, exclusive, config, sink),
    ))
}

async fn run(opts: DaemonOpts, interval: u64) -> anyhow::Result<()> {
    info!("vmscaled starting");
    let control = assemble(opts)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        control
            .run(Duration::from_secs(interval), shutdown_rx)
            .await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("vmscaled stopped");
    Ok(())
}

async fn once(opts: DaemonOpts) -> anyhow::Result<()> {
    let control = assemble(opts)?;
    let report = tokio::task::spawn_blocking(move || control.tick()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&path)?;
    let policy = &config.policy;

    println!("policy:");
    println!("  staleness:             {:?}", policy.staleness);
    println!("  utilization_threshold: {}", policy.utilization_threshold);
    println!(
        "  busy drain:            1 of {} ({:?})",
        policy.busy_drain_stride, policy.busy_drain_order
    );
    println!("  max_in_flight:         {}", policy.max_in_flight);
    println!("  floors:                {} cores, {} GiB", policy.min_cores, policy.min_ram);
    println!("  lock:                  {} (ttl {:?})", policy.lock_name, policy.lock_ttl);
    println!("templates:");
    if config.catalog.is_empty() {
        println!("  (none, scale-out disabled)");
    }
    for t in config.catalog.list_templates().values() {
        println!(
            "  {:<12} {:>3} cores {:>4} GiB  max_age {:>6}s  {}",
            t.name, t.cores, t.ram, t.max_age_seconds, t.profile
        );
    }
    Ok(())
}
