//! IPAM pool errors

use thiserror::Error;

/// Errors returned by a `NodeNetworkConfigSpecUpdater`
#[derive(Debug, Error)]
pub enum SpecUpdateError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The authority refused the spec
    #[error("Spec update rejected: {0}")]
    Rejected(String),
}

/// Errors returned by an IP pool snapshot source
#[derive(Debug, Error)]
pub enum StoreError {
    /// Not enough IPs in the requested state to satisfy a transition
    #[error("Not enough {state} IPs: wanted {wanted}, found {found}")]
    InsufficientIPs {
        /// State the IPs were expected to be in
        state: String,
        /// Number of IPs requested
        wanted: usize,
        /// Number of IPs actually found
        found: usize,
    },
}

/// Errors that can occur in the pool monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The monitor's cancellation token fired
    #[error("Pool monitor context closed")]
    Cancelled,

    /// The monitor loop is gone and can no longer accept status updates
    #[error("Pool monitor is not running")]
    Stopped,

    /// Writing the NodeNetworkConfig spec failed
    #[error("Failed to update NodeNetworkConfig spec: {0}")]
    UpdateSpec(#[from] SpecUpdateError),

    /// Marking IPs as pending release failed
    #[error("Failed to mark IPs as pending release: {0}")]
    MarkPendingRelease(#[from] StoreError),
}
