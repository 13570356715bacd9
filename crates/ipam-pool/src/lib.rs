//! IPAM Pool
//!
//! Node-local management of the pre-provisioned secondary IP pool.
//!
//! DNC provisions IPs to a node through the `NodeNetworkConfig` CRD. The
//! node asks for more or fewer IPs by writing `requestedIPCount` and
//! `ipsNotInUse` to the spec; DNC answers asynchronously through the status.
//! The [`Monitor`] keeps the number of free IPs between the scaler's request
//! and release thresholds so pods never wait on a round trip to DNC.
//!
//! # Components
//!
//! - [`scaler`]: scaler clamping and free-IP threshold arithmetic
//! - [`store`]: the node's IP configurations and their lifecycle states
//! - [`monitor`]: the control loop and its handle
//! - [`metrics`]: Prometheus recorder for pool gauges and scale latency

pub mod error;
pub mod metrics;
pub mod monitor;
pub mod scaler;
pub mod source;
pub mod spec_builder;
pub mod store;
pub mod updater;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;


pub use error::{MonitorError, SpecUpdateError, StoreError};
pub use metrics::{NoopMetrics, PoolMetrics, PoolStateObservation, PrometheusMetrics};
pub use monitor::{
    DEFAULT_REFRESH_DELAY, Monitor, MonitorHandle, MonitorOptions, PoolAction,
    PoolMonitorStateSnapshot, decide,
};
pub use scaler::{calculate_max_free_ips, calculate_min_free_ips, clamp_scaler};
pub use source::{IpConfigState, IpConfigurationStatus, IpPoolCounts, IpPoolSnapshotSource};
pub use store::{IpConfigStore, SyncSummary};
pub use updater::NodeNetworkConfigSpecUpdater;
