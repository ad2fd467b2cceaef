//! memkilld: standalone memory watchdog daemon.
//!
//! Loads the watchdog configuration, starts the watchdog thread over the
//! current process, and runs until SIGTERM/SIGINT or until the watchdog
//! escalates. Worker frameworks embedding the watchdog use the
//! `memkill-daemon` library directly and share their job registry; this
//! binary runs with an empty registry and guards the process it is
//! launched in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use memkill_core::config::Config;
use memkill_core::registry::JobRegistry;
use memkill_daemon::watchdog::MemoryWatchdog;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "memkilld", about = "Worker-pool memory watchdog daemon", version)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    config.validate().context("validating config")?;

    if args.dump_config {
        println!("{}", config.to_toml().context("serializing config")?);
        return Ok(());
    }

    let registry = Arc::new(JobRegistry::new());
    let watchdog =
        MemoryWatchdog::new(&config, registry).context("building memory watchdog")?;
    let handle = watchdog.spawn().context("spawning watchdog thread")?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    handle.stop();
    Ok(())
}
