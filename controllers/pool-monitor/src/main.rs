//! IPAM Pool Monitor
//!
//! Node daemon that keeps the node's pre-provisioned secondary IP pool sized
//! to pod demand.
//!
//! It watches the node's `NodeNetworkConfig`, mirrors the IPs DNC has
//! provisioned into a local IP store, and runs the pool monitor, which
//! grows or shrinks the pool by writing `requestedIPCount` and `ipsNotInUse`
//! back to the CRD spec.

mod config;
mod controller;
mod error;
mod http;
mod spec_updater;
mod watcher;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls client needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting IPAM Pool Monitor");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace);
    info!("  Refresh delay: {:?}", config.refresh_delay);
    info!("  Metrics address: {}", config.metrics_addr);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    // Initialize and run controller
    let controller = Controller::new(config, cancel).await?;
    controller.run().await?;

    Ok(())
}
