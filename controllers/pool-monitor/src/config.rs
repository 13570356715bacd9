//! Daemon configuration from environment variables.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_REFRESH_MS: u64 = 1000;
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Runtime configuration for the pool monitor daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name of this node, which is also the name of its NodeNetworkConfig
    pub node_name: String,
    /// Namespace holding the NodeNetworkConfig objects
    pub namespace: String,
    /// Pool monitor refresh delay
    pub refresh_delay: Duration,
    /// Listen address for `/healthz`, `/metrics` and `/debug/ipam`
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// - `NODE_NAME` (required)
    /// - `NNC_NAMESPACE` (default `kube-system`)
    /// - `POOL_MONITOR_REFRESH_MS` (default 1000)
    /// - `METRICS_ADDR` (default `0.0.0.0:9090`)
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let node_name = lookup("NODE_NAME")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig(
                    "NODE_NAME environment variable is required".to_string(),
                )
            })?;

        let namespace = lookup("NNC_NAMESPACE")
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let refresh_ms = match lookup("POOL_MONITOR_REFRESH_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "POOL_MONITOR_REFRESH_MS must be a number of milliseconds, got {:?}: {}",
                    raw, e
                ))
            })?,
            None => DEFAULT_REFRESH_MS,
        };

        let raw_addr = lookup("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = raw_addr.parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "METRICS_ADDR must be host:port, got {:?}: {}",
                raw_addr, e
            ))
        })?;

        Ok(Self {
            node_name,
            namespace,
            refresh_delay: Duration::from_millis(refresh_ms),
            metrics_addr,
        })
    }
}
