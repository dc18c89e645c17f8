//! relayhub - rendezvous hub server
//!
//! Serves the register / identify / users / send / stream endpoints and
//! the `/ws` duplex connection until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use relayhub::hub::{serve, Hub, HubArgs, HubConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args = HubArgs::parse();

    // Initialize logging
    let default_filter = if args.debug {
        "relayhub=debug,tower_http=debug,warn"
    } else {
        "relayhub=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HubConfig::from_args(&args)?;
    info!(
        "Starting hub (max recipients {}, queue capacity {}, send timeout {:?})",
        config.max_recipients, config.queue_capacity, config.send_timeout
    );

    let hub = Arc::new(Hub::new(config));
    let (addr, server) = serve(hub.clone()).await?;

    info!("Hub running on {}", addr);
    println!("Press Ctrl+C to stop the hub");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    hub.shutdown();
    server.await?;

    Ok(())
}
