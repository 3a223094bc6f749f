//! uird - UIROBOT gateway daemon
//!
//! Accepts UIMessage clients over TCP and bridges them onto a CAN bus.
//!
//! # Usage
//!
//! Demo mode, two simulated motors on a virtual bus:
//! ```bash
//! ./uird
//! ```
//!
//! Real bus:
//! ```bash
//! ./uird --config config/uird.toml
//! ./uird --config config/uird.toml --interface can0
//! ```
//!
//! If no config file is provided, the built-in demo configuration is used.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uir_bridge::config::SocketCanConfig;
use uir_bridge::{create_transport, Bridge, BridgeConfig, TransportConfig};

#[derive(Parser, Debug)]
#[command(name = "uird")]
#[command(about = "UIROBOT TCP-to-CAN gateway daemon")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Use this SocketCAN interface instead of the configured transport
    #[arg(short, long)]
    interface: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "uird=debug,uir_bridge=debug,uir_proto=debug"
    } else {
        "uird=info,uir_bridge=info,uir_proto=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    tracing::info!(
        gateway = config.gateway.resolved_node_id()?,
        model = %config.gateway.model,
        nodes = config.nodes.len(),
        "Starting uird"
    );

    let transport = create_transport(&config.transport).context("Failed to open CAN transport")?;
    tracing::info!(transport = %transport.name(), "CAN transport ready");

    let listener = TcpListener::bind(&config.listen.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen.address))?;

    let bridge = Bridge::new(config)?;
    let shutdown = bridge.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    bridge.serve(listener, transport).await?;
    Ok(())
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from: {}", path);
            BridgeConfig::load(path).with_context(|| format!("Failed to load {}", path))?
        }
        None => {
            tracing::info!("No config file provided, using virtual demo bus");
            BridgeConfig::demo()
        }
    };

    if let Some(listen) = &args.listen {
        config.listen.address = listen.clone();
    }
    if let Some(interface) = &args.interface {
        let bitrate = config
            .gateway
            .parsed_can_bitrate()?
            .bits_per_second();
        config.transport = TransportConfig::SocketCan(SocketCanConfig {
            interface: interface.clone(),
            bitrate,
        });
    }

    config.validate()?;
    Ok(config)
}
