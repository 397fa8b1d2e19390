//! fleetd — the fleet orchestrator daemon.
//!
//! Single binary that assembles every fleet subsystem:
//! - Cluster registry (redb)
//! - Scheduler + unit pipeline
//! - Route rebuild worker
//! - Node auto-scaler
//! - Admin REST API
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleet/fleet.toml --port 8080 --data-dir /var/lib/fleet
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;

use fleet_core::FleetConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Provider {
    /// In-process runtime, router, IaaS and app catalog.
    Memory,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet orchestrator daemon")]
struct Cli {
    /// Path to fleet.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on. Overrides `daemon.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state. Overrides `daemon.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Backend for the runtime, router, IaaS and app catalog.
    #[arg(long, value_enum, default_value = "memory")]
    provider: Provider,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.daemon.data_dir = data_dir;
    }
    info!(provider = ?cli.provider, config = ?cli.config, "fleet daemon starting");

    let daemon = match cli.provider {
        Provider::Memory => daemon::Daemon::with_memory_provider(config)?,
    };
    daemon.run().await
}
