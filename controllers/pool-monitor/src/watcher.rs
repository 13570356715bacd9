//! NodeNetworkConfig watcher.
//!
//! Watches this node's NodeNetworkConfig, folds its status into the IP
//! store and forwards the object to the pool monitor.

use crate::error::ControllerError;
use crds::NodeNetworkConfig;
use futures::TryStreamExt;
use ipam_pool::{IpConfigStore, MonitorHandle};
use kube::Api;
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches the node's own NodeNetworkConfig.
pub struct NncWatcher {
    api: Api<NodeNetworkConfig>,
    node_name: String,
    store: Arc<IpConfigStore>,
    monitor: MonitorHandle,
}

impl NncWatcher {
    /// Creates a new watcher instance.
    pub fn new(
        api: Api<NodeNetworkConfig>,
        node_name: String,
        store: Arc<IpConfigStore>,
        monitor: MonitorHandle,
    ) -> Self {
        Self {
            api,
            node_name,
            store,
            monitor,
        }
    }

    /// Watches until `cancel` fires or the stream fails.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("NodeNetworkConfig watcher shutdown requested");
                Ok(())
            }
            result = self.watch_node_network_config() => result,
        }
    }

    async fn watch_node_network_config(&self) -> Result<(), ControllerError> {
        info!("Starting NodeNetworkConfig watcher for node {}", self.node_name);

        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        let mut stream = Box::pin(watcher(self.api.clone(), config).default_backoff());

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Apply(nnc) | watcher::Event::InitApply(nnc) => {
                    forward_node_network_config(&self.store, &self.monitor, nnc).await?;
                }
                watcher::Event::Delete(nnc) => {
                    let name = nnc.metadata.name.as_deref().unwrap_or("<unknown>");
                    warn!("NodeNetworkConfig deleted: {}", name);
                }
                watcher::Event::Init => {
                    debug!("NodeNetworkConfig watcher initialized");
                }
                watcher::Event::InitDone => {
                    info!("NodeNetworkConfig watcher initialization complete");
                }
            }
        }

        Ok(())
    }
}

/// Syncs the status into the store, then hands the object to the monitor.
///
/// The store is updated first so the monitor never sees a requested count
/// that the store has not caught up with.
pub async fn forward_node_network_config(
    store: &IpConfigStore,
    monitor: &MonitorHandle,
    nnc: NodeNetworkConfig,
) -> Result<(), ControllerError> {
    let name = nnc.metadata.name.as_deref().unwrap_or("<unknown>");
    match nnc.status.as_ref() {
        Some(status) => {
            let summary = store.sync_network_containers(status);
            debug!(
                "NodeNetworkConfig {} applied: status={:?}, added={}, removed={}, retained={}",
                name, status.status, summary.added, summary.removed, summary.retained
            );
        }
        None => debug!("NodeNetworkConfig {} has no status yet", name),
    }

    monitor.update(nnc).await?;
    Ok(())
}
