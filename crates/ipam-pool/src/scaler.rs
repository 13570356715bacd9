//! Scaler normalization and pool threshold arithmetic
//!
//! DNC publishes the scaler in the NodeNetworkConfig status. The values are
//! normally sane, but a zero batch or an inverted threshold pair would stall
//! or oscillate the pool, so every scaler is clamped before the monitor uses it.

use crds::{NodeNetworkConfig, Scaler};

/// Clamps a scaler into the range the monitor can work with.
///
/// The steps are applied in order, so a batch size larger than the max IP
/// count is compared against the already-clamped max.
pub fn clamp_scaler(scaler: &mut Scaler) {
    if scaler.max_ip_count < 1 {
        scaler.max_ip_count = 1;
    }
    if scaler.batch_size < 1 {
        scaler.batch_size = 1;
    }
    if scaler.batch_size > scaler.max_ip_count {
        scaler.batch_size = scaler.max_ip_count;
    }
    scaler.request_threshold_percent = scaler.request_threshold_percent.clamp(1, 100);
    if scaler.release_threshold_percent < scaler.request_threshold_percent + 100 {
        scaler.release_threshold_percent = scaler.request_threshold_percent + 100;
    }
}

/// Clamps the scaler carried in a NodeNetworkConfig status.
///
/// A config without a status gets a default status first, which clamps to
/// the smallest legal scaler.
pub fn clamp_node_network_config(nnc: &mut NodeNetworkConfig) {
    let status = nnc.status.get_or_insert_with(Default::default);
    clamp_scaler(&mut status.scaler);
}

/// Free IP count below which the pool grows
pub fn calculate_min_free_ips(scaler: &Scaler) -> i64 {
    percent_of_batch(scaler.batch_size, scaler.request_threshold_percent)
}

/// Free IP count at or above which the pool shrinks
pub fn calculate_max_free_ips(scaler: &Scaler) -> i64 {
    percent_of_batch(scaler.batch_size, scaler.release_threshold_percent)
}

fn percent_of_batch(batch_size: i64, percent: i64) -> i64 {
    // float math truncated toward zero: batch 15 at 50% is 7
    (batch_size as f64 * (percent as f64 / 100.0)) as i64
}
