//! filerelay
//!
//! A small HTTP/1.x server with two deployment roles sharing one accept
//! loop: a static file service with whitelisted uploads, or a minimal GET
//! forwarding proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                    FILERELAY                     │
//!                    │                                                  │
//!   Client ──────────┼─▶ net (slot, accept) ─▶ http::server (task)      │
//!                    │                          │                       │
//!                    │                          ▼                       │
//!                    │                   http::request (parse)          │
//!                    │                          │                       │
//!                    │                          ▼                       │
//!                    │                     routing (mode)               │
//!                    │                  ┌───────┴────────┐              │
//!                    │                  ▼                ▼              │
//!                    │          files (GET/POST)   proxy (forward) ─────┼──▶ Origin
//!                    │                  │                │              │
//!   Client ◀─────────┼── http::response ◀┘        relay ◀┘              │
//!                    │                                                  │
//!                    │  config · lifecycle · observability · resilience │
//!                    └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use filerelay::config::{LogFormat, ServiceMode};
use filerelay::http::HttpServer;
use filerelay::lifecycle::{build_config, prepare, spawn_signal_handler, Overrides, Shutdown};
use filerelay::observability::init_logging;

#[derive(Parser)]
#[command(name = "filerelay", version)]
#[command(about = "Static file service or GET forwarding proxy with bounded concurrency", long_about = None)]
struct Cli {
    /// TCP port to listen on.
    port: u16,

    /// Deployment role.
    #[arg(long, value_enum)]
    mode: Option<ServiceMode>,

    /// Directory files are served from and uploaded to.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Optional TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of connections handled at once.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let overrides = Overrides {
        port: cli.port,
        mode: cli.mode,
        root: cli.root,
        max_connections: cli.max_connections,
        log_level: cli.log_level,
        log_format: cli.log_format,
    };

    let config = build_config(cli.config.as_deref(), &overrides)?;
    init_logging(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.mode,
        port = config.listener.port,
        max_connections = config.listener.max_connections,
        "filerelay starting"
    );

    let listener = prepare(&config).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    let server = HttpServer::new(&config);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
