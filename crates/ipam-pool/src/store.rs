//! In-memory IP configuration store
//!
//! Holds every secondary IP provisioned to the node and its lifecycle state.
//! DNC's view (the NodeNetworkConfig status) is folded in with
//! `sync_network_containers`; the pool monitor reads it through
//! `IpPoolSnapshotSource`.

use crate::error::StoreError;
use crate::source::{IpConfigState, IpConfigurationStatus, IpPoolCounts, IpPoolSnapshotSource};
use crds::NodeNetworkConfigStatus;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Result of folding a NodeNetworkConfig status into the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// IPs new in the status, added as `Available`
    pub added: usize,
    /// IPs missing from the status and dropped from the store
    pub removed: usize,
    /// IPs missing from the status but kept because a pod still holds them
    pub retained: usize,
}

/// Thread-safe map of IP configurations, ordered by ID
#[derive(Debug, Default)]
pub struct IpConfigStore {
    ip_configs: RwLock<BTreeMap<String, IpConfigurationStatus>>,
}

impl IpConfigStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, IpConfigurationStatus>> {
        self.ip_configs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, IpConfigurationStatus>> {
        self.ip_configs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_state(&self, state: IpConfigState) -> Vec<IpConfigurationStatus> {
        self.read()
            .values()
            .filter(|ip| ip.state == state)
            .cloned()
            .collect()
    }

    /// Reconciles the store against the IPs DNC reports for the node.
    ///
    /// New assignments arrive as `Available`. IPs that DNC no longer reports
    /// are dropped if nothing holds them (`Available`, `PendingRelease`);
    /// assigned or programming IPs are kept until their pod lets go.
    pub fn sync_network_containers(&self, status: &NodeNetworkConfigStatus) -> SyncSummary {
        let mut desired = BTreeMap::new();
        for nc in &status.network_containers {
            for assignment in &nc.ip_assignments {
                desired.insert(assignment.name.clone(), (nc.id.clone(), assignment.ip.clone()));
            }
        }

        let mut summary = SyncSummary::default();
        let mut ip_configs = self.write();

        ip_configs.retain(|id, ip| {
            if desired.contains_key(id) {
                return true;
            }
            match ip.state {
                IpConfigState::Available | IpConfigState::PendingRelease => {
                    summary.removed += 1;
                    false
                }
                IpConfigState::Assigned | IpConfigState::PendingProgramming => {
                    warn!(
                        "IP config {} ({}) is no longer in the NodeNetworkConfig status but is still {}",
                        id, ip.ip_address, ip.state
                    );
                    summary.retained += 1;
                    true
                }
            }
        });

        for (id, (nc_id, ip_address)) in desired {
            match ip_configs.get_mut(&id) {
                Some(existing) => {
                    existing.nc_id = nc_id;
                    existing.ip_address = ip_address;
                }
                None => {
                    ip_configs.insert(
                        id.clone(),
                        IpConfigurationStatus {
                            id,
                            nc_id,
                            ip_address,
                            state: IpConfigState::Available,
                        },
                    );
                    summary.added += 1;
                }
            }
        }

        debug!(
            "Synced IP configs: added={}, removed={}, retained={}, total={}",
            summary.added,
            summary.removed,
            summary.retained,
            ip_configs.len()
        );
        summary
    }

    /// Moves IPs between `Available` and `Assigned` until exactly `count` are assigned.
    ///
    /// Simulates pods coming and going.
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_allocated_count(&self, count: usize) -> Result<(), StoreError> {
        let mut ip_configs = self.write();
        let assigned = ip_configs
            .values()
            .filter(|ip| ip.state == IpConfigState::Assigned)
            .count();

        if count > assigned {
            let wanted = count - assigned;
            let available: Vec<String> = ip_configs
                .values()
                .filter(|ip| ip.state == IpConfigState::Available)
                .map(|ip| ip.id.clone())
                .take(wanted)
                .collect();
            if available.len() < wanted {
                return Err(StoreError::InsufficientIPs {
                    state: IpConfigState::Available.to_string(),
                    wanted,
                    found: available.len(),
                });
            }
            for id in available {
                if let Some(ip) = ip_configs.get_mut(&id) {
                    ip.state = IpConfigState::Assigned;
                }
            }
        } else {
            for ip in ip_configs
                .values_mut()
                .filter(|ip| ip.state == IpConfigState::Assigned)
                .take(assigned - count)
            {
                ip.state = IpConfigState::Available;
            }
        }
        Ok(())
    }
}

impl IpPoolSnapshotSource for IpConfigStore {
    fn pod_ip_config_state(&self) -> BTreeMap<String, IpConfigurationStatus> {
        self.read().clone()
    }

    fn pending_programming_ip_configs(&self) -> Vec<IpConfigurationStatus> {
        self.in_state(IpConfigState::PendingProgramming)
    }

    fn allocated_ip_configs(&self) -> Vec<IpConfigurationStatus> {
        self.in_state(IpConfigState::Assigned)
    }

    fn pending_release_ip_configs(&self) -> Vec<IpConfigurationStatus> {
        self.in_state(IpConfigState::PendingRelease)
    }

    fn available_ip_configs(&self) -> Vec<IpConfigurationStatus> {
        self.in_state(IpConfigState::Available)
    }

    /// Pending-programming IPs are released first, then available ones.
    fn mark_ip_as_pending_release(
        &self,
        count: usize,
    ) -> Result<BTreeMap<String, IpConfigurationStatus>, StoreError> {
        let mut ip_configs = self.write();
        let mut marked = BTreeMap::new();

        for from in [IpConfigState::PendingProgramming, IpConfigState::Available] {
            for ip in ip_configs.values_mut().filter(|ip| ip.state == from) {
                if marked.len() == count {
                    break;
                }
                ip.state = IpConfigState::PendingRelease;
                marked.insert(ip.id.clone(), ip.clone());
            }
        }

        if marked.len() < count {
            warn!(
                "Marked {} IPs as pending release, expected {}",
                marked.len(),
                count
            );
        } else {
            debug!("Marked {} IPs as pending release", marked.len());
        }
        Ok(marked)
    }

    fn pool_counts(&self) -> IpPoolCounts {
        IpPoolCounts::from_configs(self.read().values())
    }
}
