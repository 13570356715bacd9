//! IP pool snapshot source
//!
//! The node's view of its secondary IPs. The monitor only reads from it,
//! except for handing IPs back through `mark_ip_as_pending_release`.

use crate::error::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a single IP configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IpConfigState {
    /// Provisioned and free to hand to a pod
    Available,
    /// Handed to a pod
    Assigned,
    /// Given back to DNC, waiting for it to be removed from the status
    PendingRelease,
    /// Handed out but not yet programmed on the host
    PendingProgramming,
}

impl fmt::Display for IpConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpConfigState::Available => "Available",
            IpConfigState::Assigned => "Assigned",
            IpConfigState::PendingRelease => "PendingRelease",
            IpConfigState::PendingProgramming => "PendingProgramming",
        };
        f.write_str(s)
    }
}

/// A secondary IP known to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigurationStatus {
    /// Stable IP configuration ID, as used in `ipsNotInUse`
    pub id: String,
    /// Network container the IP belongs to
    pub nc_id: String,
    /// The IP address itself
    pub ip_address: String,
    /// Where the IP is in its lifecycle
    pub state: IpConfigState,
}

/// Per-state IP counts at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpPoolCounts {
    /// Every IP in the pool
    pub total: usize,
    /// `Assigned` IPs
    pub allocated: usize,
    /// `Available` IPs
    pub available: usize,
    /// `PendingRelease` IPs
    pub pending_release: usize,
    /// `PendingProgramming` IPs
    pub pending_programming: usize,
}

impl IpPoolCounts {
    /// Tallies a set of IP configurations by state
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a IpConfigurationStatus>) -> Self {
        let mut counts = Self::default();
        for config in configs {
            counts.total += 1;
            match config.state {
                IpConfigState::Available => counts.available += 1,
                IpConfigState::Assigned => counts.allocated += 1,
                IpConfigState::PendingRelease => counts.pending_release += 1,
                IpConfigState::PendingProgramming => counts.pending_programming += 1,
            }
        }
        counts
    }

    /// IPs in the pool that are not assigned to a pod
    pub fn unallocated(&self) -> usize {
        self.total - self.allocated
    }
}

/// Read access to the node's IP pool, plus the one write the monitor needs.
///
/// Implementations must be safe to call from the monitor task while the
/// rest of the node keeps assigning and releasing IPs.
pub trait IpPoolSnapshotSource: Send + Sync {
    /// Every IP configuration on the node, keyed by ID
    fn pod_ip_config_state(&self) -> BTreeMap<String, IpConfigurationStatus>;

    /// IPs waiting to be programmed, in ID order
    fn pending_programming_ip_configs(&self) -> Vec<IpConfigurationStatus>;

    /// IPs assigned to pods, in ID order
    fn allocated_ip_configs(&self) -> Vec<IpConfigurationStatus>;

    /// IPs given back to DNC, in ID order
    fn pending_release_ip_configs(&self) -> Vec<IpConfigurationStatus>;

    /// IPs free to hand out, in ID order
    fn available_ip_configs(&self) -> Vec<IpConfigurationStatus>;

    /// Moves up to `count` unassigned IPs to `PendingRelease` and returns the IPs it moved
    fn mark_ip_as_pending_release(
        &self,
        count: usize,
    ) -> Result<BTreeMap<String, IpConfigurationStatus>, StoreError>;

    /// Per-state counts taken from a single view of the pool
    fn pool_counts(&self) -> IpPoolCounts {
        IpPoolCounts::from_configs(self.pod_ip_config_state().values())
    }
}
