//! Remote Device server
//!
//! Main CLI entry point: loads `rdev.toml`, applies command-line overrides
//! and serves sessions until killed.

use anyhow::{Context, Result};
use clap::Parser;
use remote_device::config::ServerConfig;
use remote_device::device::DeviceRegistry;
use remote_device::server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rdev")]
#[command(version)]
#[command(about = "Serve compute devices to remote clients", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Config file (default: search upward for rdev.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device new sessions are bound to (e.g. CPU, CPU:1, NULL)
    #[arg(long)]
    device: Option<String>,

    /// Serve each connection on its own thread
    #[arg(long)]
    concurrent: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            ServerConfig::find_and_load(&cwd).context("Failed to load rdev.toml")?
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(device) = cli.device {
        config.device.default = device;
    }
    if cli.concurrent {
        config.server.concurrent = true;
    }

    let registry = Arc::new(DeviceRegistry::with_builtin());
    log::debug!("device kinds: {}", registry.kinds().join(", "));

    let server = Server::bind(&config, registry)
        .with_context(|| format!("Failed to start server on {}", config.bind_address()))?;
    server.serve().context("Server stopped")?;
    Ok(())
}
