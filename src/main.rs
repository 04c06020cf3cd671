//! chorus daemon entry point.
//!
//! Wires the BlueZ stack, the PulseAudio router, and the connection
//! orchestrator together, then runs until interrupted. Status
//! notifications are mirrored into the log until a wire transport is
//! attached.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chorus_audio::PulseRouter;
use chorus_bluetooth::BluezStack;
use chorus_core::control::render_status;
use chorus_core::{ChannelHandler, Config, ConnectionService, DiscoveryCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!("Reserved controller: {}", config.reserved_controller);

    if let Err(e) = chorus_audio::setup().await {
        warn!("PulseAudio setup incomplete: {}", e);
    }

    let stack = Arc::new(BluezStack::new().await.context("connecting to BlueZ")?);
    stack
        .monitor_known_devices()
        .await
        .context("attaching device monitors")?;

    let discovery = DiscoveryCoordinator::new(stack.clone());
    discovery
        .refresh_adapters()
        .await
        .context("enumerating controllers")?;

    let (status_tx, mut status_rx) = tokio::sync::mpsc::channel(64);
    let service = ConnectionService::spawn(
        stack.clone(),
        discovery.clone(),
        Arc::new(PulseRouter::new()),
        Arc::new(ChannelHandler::new(status_tx)),
        config,
    );

    tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            let frame = render_status(&event);
            info!("status: {}", String::from_utf8_lossy(&frame[1..]));
        }
    });

    info!("chorus ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    service.shutdown();
    Ok(())
}
