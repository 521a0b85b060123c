//! Cloud relay — low-latency WebSocket video relay server.
//!
//! Usage:
//!   relay-server serve --config relay.toml
//!   relay-server serve --bind 0.0.0.0 --port 8088

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay::config::RelayConfig;
use relay::room::RoomManager;
use relay::server::{build_router, AppState};

#[derive(Parser)]
#[command(name = "relay-server", about = "Low-latency video relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bind address, overrides the config file.
        #[arg(long)]
        bind: Option<String>,
        /// Listen port, overrides the config file.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind, port } => {
            run_serve(config, bind, port).await;
        }
    }
}

async fn run_serve(config_path: Option<PathBuf>, bind_override: Option<String>, port_override: Option<u16>) {
    let mut cfg = match config_path {
        Some(path) => match RelayConfig::from_file(&path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to load config");
                std::process::exit(1);
            }
        },
        None => RelayConfig::default(),
    };

    if let Some(bind) = bind_override {
        cfg.bind = bind;
    }
    if let Some(port) = port_override {
        cfg.port = port;
    }

    let addr = match relay::server::local_addr(&cfg.bind, cfg.port) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, bind = %cfg.bind, port = cfg.port, "Invalid bind address");
            std::process::exit(1);
        }
    };

    info!(%addr, "Starting relay server");

    let state = AppState {
        rooms: RoomManager::new(),
    };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "Relay server exited with error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down…"),
        Err(e) => error!(error = %e, "Signal error"),
    }
}
