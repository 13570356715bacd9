//! Kubernetes-backed NodeNetworkConfig spec updater.

use async_trait::async_trait;
use crds::{NodeNetworkConfig, NodeNetworkConfigSpec};
use ipam_pool::{NodeNetworkConfigSpecUpdater, SpecUpdateError};
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::{Value, json};
use tracing::debug;

/// Writes the monitor's desired spec to the node's NodeNetworkConfig.
pub struct KubeSpecUpdater {
    api: Api<NodeNetworkConfig>,
    name: String,
}

impl KubeSpecUpdater {
    /// Creates an updater for the NodeNetworkConfig called `name`.
    pub fn new(api: Api<NodeNetworkConfig>, name: String) -> Self {
        Self { api, name }
    }
}

/// Merge patch body for a spec write.
///
/// `ipsNotInUse` is always present so that an empty list clears the field
/// on the server; the CRD type omits it when empty.
pub fn spec_patch(spec: &NodeNetworkConfigSpec) -> Value {
    json!({
        "spec": {
            "requestedIPCount": spec.requested_ip_count,
            "ipsNotInUse": spec.ips_not_in_use,
        }
    })
}

#[async_trait]
impl NodeNetworkConfigSpecUpdater for KubeSpecUpdater {
    async fn update_spec(
        &self,
        spec: &NodeNetworkConfigSpec,
    ) -> Result<NodeNetworkConfig, SpecUpdateError> {
        debug!(
            "Patching NodeNetworkConfig {}: requestedIPCount={}, ipsNotInUse={}",
            self.name,
            spec.requested_ip_count,
            spec.ips_not_in_use.len()
        );
        let patch = spec_patch(spec);
        let nnc = self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(nnc)
    }
}
