//! Fleetgate core service entry point.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use fleetgate::gateway::Gateway;
use fleetgate::rest_api::create_app;
use fleetgate::{GatewayConfig, server};
use tracing::info;

/// Fleet-management gateway and message-bus router.
#[derive(Debug, Parser)]
#[command(name = "fleetgate", version, about)]
struct Args {
    /// Address the HTTP server listens on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Broker URL override (otherwise FLEETGATE_BROKER_URL or the default).
    #[arg(long)]
    broker_url: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fleetgate=info,warn"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = GatewayConfig::from_env().context("loading configuration")?;
    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }

    let mut gateway = Gateway::new(config);
    gateway.start().await;

    let app = create_app(gateway.app_state());
    let (listener, addr) = server::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(%addr, "fleetgate listening");

    let shutdown = gateway.shutdown_token();
    let server_task = tokio::spawn(server::serve_with_graceful_shutdown(
        listener,
        app,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();
    server_task.await.context("joining http server")??;
    gateway.shutdown().await;

    Ok(())
}
