#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # froxy
//!
//! Relay-tunneled HTTP/CONNECT proxy for reaching HTTP services behind NAT.
//!
//! ## Subcommands
//!
//! - `froxy edge` — local proxy on `edge.listen`; requests for hosts in
//!   `edge.domain_filter` go through the relay, everything else goes direct
//! - `froxy agent` — runs inside the private network and executes relayed
//!   requests against hosts allowed by `agent.allowed_domains`
//!
//! Both dial `{relay.url}/relay?type=A|B&token=…` and stop cleanly on
//! SIGINT/SIGTERM.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use froxy::config::Config;
use froxy::tunnel::LinkState;
use froxy::{Agent, EdgeProxy};

/// Relay-tunneled HTTP/CONNECT proxy.
#[derive(Parser)]
#[command(name = "froxy", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the external-facing proxy (relay client type A).
    Edge {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the internal request executor (relay client type B).
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (role, config_path) = match &cli.command {
        Commands::Edge { config } => ("edge", config.as_deref()),
        Commands::Agent { config } => ("agent", config.as_deref()),
    };

    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("froxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("froxy v{} starting ({role})", env!("CARGO_PKG_VERSION"));
    if config.relay.token == "change-me" {
        warn!("Using default relay token; set FROXY_RELAY_TOKEN or update config");
    }

    let ok = match cli.command {
        Commands::Edge { .. } => run_edge(&config).await,
        Commands::Agent { .. } => run_agent(&config).await,
    };
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_edge(config: &Config) -> bool {
    let handle = match EdgeProxy::start(config).await {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to start edge proxy: {e}");
            return false;
        }
    };
    let status = tokio::spawn(log_link_status(handle.link().subscribe()));

    shutdown_signal().await;
    info!("Shutting down...");
    let clean = handle.stop().await;
    status.abort();
    if !clean {
        warn!("Some tasks did not finish within the shutdown grace period");
    }
    true
}

async fn run_agent(config: &Config) -> bool {
    let handle = match Agent::start(config).await {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to start agent: {e}");
            return false;
        }
    };
    let status = tokio::spawn(log_link_status(handle.link().subscribe()));

    shutdown_signal().await;
    info!("Shutting down...");
    let clean = handle.stop().await;
    status.abort();
    if !clean {
        warn!("Some tasks did not finish within the shutdown grace period");
    }
    true
}

/// Log connection-status changes (open ↔ not open).
async fn log_link_status(mut rx: watch::Receiver<LinkState>) {
    let mut was_open = *rx.borrow_and_update() == LinkState::Open;
    while rx.changed().await.is_ok() {
        let open = *rx.borrow_and_update() == LinkState::Open;
        if open != was_open {
            if open {
                info!("Relay connection status: connected");
            } else {
                warn!("Relay connection status: disconnected");
            }
            was_open = open;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
