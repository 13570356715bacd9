//! Fake request controller for tests
//!
//! Plays DNC's part: accepts spec writes, and on `reconcile` carves new IPs
//! up to the requested count, drops the IPs the node gave back and syncs the
//! result into the node's IP store.

use crate::error::SpecUpdateError;
use crate::store::IpConfigStore;
use crate::updater::NodeNetworkConfigSpecUpdater;
use crds::{
    IPAssignment, NetworkContainer, NodeNetworkConfig, NodeNetworkConfigSpec,
    NodeNetworkConfigStatus, ProvisioningStatus, Scaler,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const FAKE_NC_ID: &str = "nc-fake";

/// In-memory stand-in for DNC and the NodeNetworkConfig API
pub struct FakeRequestController {
    nnc: Mutex<NodeNetworkConfig>,
    store: Arc<IpConfigStore>,
    next_ip: AtomicUsize,
    failures_remaining: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FakeRequestController {
    /// Creates a node with `ip_config_count` IPs already provisioned and synced into `store`
    pub fn new(store: Arc<IpConfigStore>, scaler: Scaler, ip_config_count: usize) -> Self {
        let mut nnc = NodeNetworkConfig::new(
            "fake-node",
            NodeNetworkConfigSpec {
                requested_ip_count: ip_config_count as i64,
                ips_not_in_use: vec![],
            },
        );
        nnc.status = Some(NodeNetworkConfigStatus {
            scaler,
            status: ProvisioningStatus::Updated,
            network_containers: vec![NetworkContainer {
                id: FAKE_NC_ID.to_string(),
                primary_ip: "10.0.0.4".to_string(),
                subnet_name: "fake-subnet".to_string(),
                default_gateway: "10.0.0.1".to_string(),
                subnet_address_space: "10.0.0.0/8".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });

        let controller = Self {
            nnc: Mutex::new(nnc),
            store,
            next_ip: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        };
        {
            let mut nnc = controller.lock();
            controller.carve_to_requested(&mut nnc);
            controller.publish(&mut nnc);
        }
        controller
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeNetworkConfig> {
        self.nnc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn carve_to_requested(&self, nnc: &mut NodeNetworkConfig) {
        let requested = usize::try_from(nnc.spec.requested_ip_count).unwrap_or(0);
        let Some(nc) = nnc
            .status
            .as_mut()
            .and_then(|status| status.network_containers.first_mut())
        else {
            return;
        };
        while nc.ip_assignments.len() < requested {
            let n = self.next_ip.fetch_add(1, Ordering::SeqCst) + 1;
            nc.ip_assignments.push(IPAssignment {
                name: uuid::Uuid::new_v4().to_string(),
                ip: format!("10.0.{}.{}", n / 250, n % 250 + 5),
            });
        }
    }

    fn publish(&self, nnc: &mut NodeNetworkConfig) {
        if let Some(status) = nnc.status.as_mut() {
            status.assigned_ip_count = status.ip_assignment_count() as i64;
            status.status = ProvisioningStatus::Updated;
            for nc in &mut status.network_containers {
                nc.version += 1;
            }
            self.store.sync_network_containers(status);
        }
    }

    /// Simulates DNC catching up with the spec and returns the object it would publish.
    ///
    /// With `remove_pending_release`, IPs listed in `ipsNotInUse` are taken
    /// away first. The spec itself is left alone; only the node rewrites it.
    pub fn reconcile(&self, remove_pending_release: bool) -> NodeNetworkConfig {
        let mut nnc = self.lock();
        if remove_pending_release {
            let released: HashSet<String> = nnc.spec.ips_not_in_use.iter().cloned().collect();
            if let Some(status) = nnc.status.as_mut() {
                for nc in &mut status.network_containers {
                    nc.ip_assignments.retain(|ip| !released.contains(&ip.name));
                }
            }
        }
        self.carve_to_requested(&mut nnc);
        self.publish(&mut nnc);
        nnc.clone()
    }

    /// Current object, including the last spec written
    pub fn nnc(&self) -> NodeNetworkConfig {
        self.lock().clone()
    }

    /// Makes the next `n` spec writes fail
    pub fn fail_next_updates(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of spec writes attempted, failed ones included
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NodeNetworkConfigSpecUpdater for FakeRequestController {
    async fn update_spec(
        &self,
        spec: &NodeNetworkConfigSpec,
    ) -> Result<NodeNetworkConfig, SpecUpdateError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SpecUpdateError::Rejected("injected failure".to_string()));
        }

        let mut nnc = self.lock();
        nnc.spec = spec.clone();
        Ok(nnc.clone())
    }
}
