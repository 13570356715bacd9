//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the IP store,
//! the pool monitor, the NodeNetworkConfig watcher and the HTTP endpoints
//! together and runs them until shutdown.

use crate::config::Config;
use crate::error::ControllerError;
use crate::http::{self, HttpState};
use crate::spec_updater::KubeSpecUpdater;
use crate::watcher::NncWatcher;
use crds::NodeNetworkConfig;
use ipam_pool::{IpConfigStore, Monitor, MonitorError, MonitorOptions, PrometheusMetrics};
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main controller for the node's IP pool.
pub struct Controller {
    monitor: JoinHandle<Result<(), MonitorError>>,
    nnc_watcher: JoinHandle<Result<(), ControllerError>>,
    http_server: JoinHandle<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config, cancel: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Pool Monitor for node {}", config.node_name);

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;
        let nnc_api: Api<NodeNetworkConfig> = Api::namespaced(kube_client, &config.namespace);

        let registry = Registry::new();
        let metrics = Arc::new(PrometheusMetrics::new(&registry)?);
        let store = Arc::new(IpConfigStore::new());
        let updater = Arc::new(KubeSpecUpdater::new(nnc_api.clone(), config.node_name.clone()));

        let (monitor, handle) = Monitor::new(
            store.clone(),
            updater,
            metrics,
            MonitorOptions {
                refresh_delay: config.refresh_delay,
            },
        );

        let nnc_watcher_instance = NncWatcher::new(
            nnc_api,
            config.node_name.clone(),
            store.clone(),
            handle.clone(),
        );

        let http_state = HttpState {
            registry,
            monitor: handle,
            store,
        };

        // Start everything in background tasks
        let monitor = tokio::spawn(monitor.start(cancel.clone()));

        let watcher_cancel = cancel.clone();
        let nnc_watcher =
            tokio::spawn(async move { nnc_watcher_instance.watch(watcher_cancel).await });

        let http_server = tokio::spawn(http::serve(config.metrics_addr, http_state, cancel.clone()));

        Ok(Self {
            monitor,
            nnc_watcher,
            http_server,
            cancel,
        })
    }

    /// Runs the controller until shutdown.
    ///
    /// Returns once any task exits. The remaining tasks are cancelled.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IPAM Pool Monitor running");

        let result = tokio::select! {
            result = &mut self.monitor => {
                match result.map_err(|e| ControllerError::Watch(format!("Pool monitor panicked: {}", e)))? {
                    Err(MonitorError::Cancelled) => {
                        info!("Pool monitor stopped");
                        Ok(())
                    }
                    other => other.map_err(ControllerError::from),
                }
            }
            result = &mut self.nnc_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("NodeNetworkConfig watcher panicked: {}", e)))?
            }
            result = &mut self.http_server => {
                result.map_err(|e| ControllerError::Watch(format!("HTTP server panicked: {}", e)))?
            }
        };

        self.cancel.cancel();
        result
    }
}
