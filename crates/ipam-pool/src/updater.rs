//! NodeNetworkConfig spec updater
//!
//! The narrow write path from the monitor to DNC. Production uses a
//! Kubernetes patch; tests use the fake request controller.

use crate::error::SpecUpdateError;
use crds::{NodeNetworkConfig, NodeNetworkConfigSpec};

/// Writes a desired spec to the node's NodeNetworkConfig.
///
/// Returns the object as stored by the API server. Dropping the returned
/// future abandons the call; the monitor relies on this for cancellation.
#[async_trait::async_trait]
pub trait NodeNetworkConfigSpecUpdater: Send + Sync {
    /// Writes `spec` and returns the stored object
    async fn update_spec(
        &self,
        spec: &NodeNetworkConfigSpec,
    ) -> Result<NodeNetworkConfig, SpecUpdateError>;
}
