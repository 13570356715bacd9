//! NodeNetworkConfig CRD
//!
//! The per-node IP allocation contract between the node and DNC. The node
//! writes the spec (how many IPs it wants, which IPs it is giving back) and
//! DNC writes the status (scaler parameters and the network containers that
//! carry the provisioned IPs).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "acn.azure.com",
    version = "v1alpha",
    kind = "NodeNetworkConfig",
    namespaced,
    status = "NodeNetworkConfigStatus",
    shortname = "nnc",
    derive = "Default",
    printcolumn = r#"{"name":"Requested IPs", "type":"integer", "jsonPath":".spec.requestedIPCount"}"#,
    printcolumn = r#"{"name":"Allocated IPs", "type":"integer", "jsonPath":".status.assignedIPCount"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigSpec {
    /// Total number of IPs the node wants provisioned
    #[serde(default, rename = "requestedIPCount")]
    pub requested_ip_count: i64,

    /// IP configuration IDs the node has asked DNC to reclaim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips_not_in_use: Vec<String>,
}

/// Pool scaling parameters published by DNC
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scaler {
    /// Unit of pool growth and shrink
    #[serde(default)]
    pub batch_size: i64,

    /// Free IP headroom, as a percentage of the batch, above which the pool shrinks
    #[serde(default)]
    pub release_threshold_percent: i64,

    /// Free IP headroom, as a percentage of the batch, below which the pool grows
    #[serde(default)]
    pub request_threshold_percent: i64,

    /// Hard ceiling on the requested IP count
    #[serde(default, rename = "maxIPCount")]
    pub max_ip_count: i64,
}

/// Provisioning state reported by DNC
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ProvisioningStatus {
    /// DNC is working on the latest spec
    #[default]
    Updating,

    /// Status reflects the latest spec
    Updated,

    /// The subnet has no more addresses to hand out
    SubnetFull,

    /// DNC failed to process the spec
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkConfigStatus {
    /// Number of IPs DNC has assigned to the node
    #[serde(default, rename = "assignedIPCount")]
    pub assigned_ip_count: i64,

    /// Pool scaling parameters
    #[serde(default)]
    pub scaler: Scaler,

    /// Provisioning state
    #[serde(default)]
    pub status: ProvisioningStatus,

    /// Network containers carrying the node's secondary IPs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_containers: Vec<NetworkContainer>,
}

impl NodeNetworkConfigStatus {
    /// Number of IP assignments across all network containers
    pub fn ip_assignment_count(&self) -> usize {
        self.network_containers
            .iter()
            .map(|nc| nc.ip_assignments.len())
            .sum()
    }
}

/// A block of secondary IPs provisioned to the node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContainer {
    /// Network container ID
    pub id: String,

    /// Primary IP of the network container
    #[serde(default, rename = "primaryIP")]
    pub primary_ip: String,

    /// Subnet the IPs are carved from
    #[serde(default)]
    pub subnet_name: String,

    /// Secondary IPs in this network container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_assignments: Vec<IPAssignment>,

    #[serde(default)]
    pub default_gateway: String,

    #[serde(default)]
    pub subnet_address_space: String,

    /// Monotonic version bumped by DNC on every change
    #[serde(default)]
    pub version: i64,
}

/// A single secondary IP and its stable ID
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPAssignment {
    /// IP configuration ID
    pub name: String,

    /// IP address
    #[serde(rename = "ip")]
    pub ip: String,
}

impl NodeNetworkConfig {
    /// Scaler from the status, or an all-zero scaler if DNC has not written status yet
    pub fn scaler(&self) -> Scaler {
        self.status.as_ref().map(|s| s.scaler).unwrap_or_default()
    }
}
