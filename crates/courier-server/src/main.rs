//! courier-server: real-time one-to-one messaging server.
//!
//! Accepts WebSocket connections, authenticates them with bearer tokens,
//! and routes messages between user pairs with SQLite persistence.

mod config;
mod handshake;
mod locks;
mod presence;
mod rate_limit;
mod server;
mod store;
mod transport;

use clap::Parser;
use config::ServerConfig;
use server::CourierServer;
use std::path::PathBuf;
use tracing::{error, info};

/// courier-server — real-time messaging server
#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about = "Real-time messaging server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.courier/config.toml")]
    config: String,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,

    /// Signing secret file
    #[arg(long)]
    secret_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting courier-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.port,
        cli.db.as_deref(),
        cli.secret_file.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let courier_server = match CourierServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = courier_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("courier-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
