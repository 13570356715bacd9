//! Outbound spec construction

use crate::source::IpConfigurationStatus;
use crds::NodeNetworkConfigSpec;

/// Builds the spec to send to DNC.
///
/// `ipsNotInUse` is always rebuilt from the live pending-release set rather
/// than carried over from the cached spec, so IPs DNC has already reclaimed
/// drop out of the list.
pub fn build_spec(
    requested_ip_count: i64,
    pending_release: &[IpConfigurationStatus],
) -> NodeNetworkConfigSpec {
    NodeNetworkConfigSpec {
        requested_ip_count,
        ips_not_in_use: pending_release.iter().map(|ip| ip.id.clone()).collect(),
    }
}
