//! NodeNetworkConfig CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the IPAM pool monitor and
//! the tooling around it.

pub mod node_network_config;

pub use node_network_config::*;
