//! Courier Broker - standalone message broker for Courier bridges.
//!
//! Bridges in separate processes connect to the broker with
//! `courier_core::TcpTransport`. With `--router` the broker also consumes the
//! shared outbound address and serves the service directory, so callers can
//! reach published services by filter alone.

mod server;

use anyhow::Result;
use clap::Parser;
use courier_core::{Bridge, BrokerServer, ServiceRouter, TcpTransport, Transport};
use server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "courier-broker")]
#[command(about = "Message broker and service router for Courier bridges")]
struct Args {
    /// Broker port (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Monitoring HTTP port (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Route calls sent to the shared outbound address
    #[arg(long)]
    router: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides --debug
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Courier Broker");

    let bind: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let broker = BrokerServer::start(bind).await?;
    let broker_addr = broker.addr();

    // The router is an ordinary client of this broker.
    let (bridge, router) = if args.router {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::connect(broker_addr).await?);
        let bridge = Bridge::connect(transport).await?;
        let router = ServiceRouter::start(&bridge).await?;
        (Some(bridge), Some(router))
    } else {
        (None, None)
    };

    let state = Arc::new(AppState {
        broker,
        bridge,
        router,
    });
    let http_addr = server::start_server(state, &args.host, args.http_port).await?;

    // Intentional stdout for launchers and tests
    println!("BROKER_PORT={}", broker_addr.port());
    println!("HTTP_PORT={}", http_addr.port());

    info!("Broker running on {} (monitoring on {})", broker_addr, http_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
