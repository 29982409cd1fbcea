//! latticed — control-plane hub daemon.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lattice_core::LatticeConfig;
use latticed::Daemon;

#[derive(Parser)]
#[command(name = "latticed", version, about = "lattice control-plane hub")]
struct Args {
    /// Daemon config file. Defaults to $LATTICE_CONFIG, then ./lattice.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var("LATTICE_DEBUG").is_ok() {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match args.config {
        Some(path) => LatticeConfig::load_from(path)?,
        None => LatticeConfig::load()?,
    };

    let daemon = Daemon::start(config).await?;
    tracing::info!(addr = %daemon.addr, version = env!("CARGO_PKG_VERSION"), "latticed running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
