//! Controller-specific error types.
//!
//! This module defines error types specific to the IPAM Pool Monitor
//! daemon that are not covered by the ipam-pool library errors.

use ipam_pool::MonitorError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM Pool Monitor daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Pool monitor error
    #[error("Pool monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// HTTP listener error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
