//! IPAM pool monitor
//!
//! Keeps the node's pool of pre-provisioned IPs between the scaler thresholds.
//! The monitor owns the cached NodeNetworkConfig and the count of IPs it is
//! in the middle of releasing; nothing else touches them. Other tasks talk to
//! it through a `MonitorHandle`: new statuses go in over a channel and state
//! snapshots come out over a watch.
//!
//! Every wake-up (refresh tick or fresh status) runs one reconcile, which
//! compares the free IP count (`requested - allocated`) to the scaler
//! thresholds and either grows the pool by a batch, shrinks it back to a
//! batch multiple, clears IPs DNC has already reclaimed from `ipsNotInUse`,
//! or does nothing. A failed spec write leaves the cache alone and is retried
//! on the next wake-up.

use crate::error::MonitorError;
use crate::metrics::{PoolMetrics, PoolStateObservation};
use crate::scaler::{calculate_max_free_ips, calculate_min_free_ips, clamp_node_network_config};
use crate::source::{IpPoolCounts, IpPoolSnapshotSource};
use crate::spec_builder::build_spec;
use crate::updater::NodeNetworkConfigSpecUpdater;
use chrono::{DateTime, Utc};
use crds::{NodeNetworkConfig, NodeNetworkConfigSpec, Scaler};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Refresh delay used when none (or zero) is configured
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Tuning for the monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// How often the pool is re-evaluated without a new status
    pub refresh_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            refresh_delay: DEFAULT_REFRESH_DELAY,
        }
    }
}

/// What a reconcile decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    /// Free IPs dropped below the request threshold
    Increase,
    /// Free IPs reached the release threshold
    Decrease,
    /// `ipsNotInUse` no longer matches the pending-release set
    CleanPendingRelease,
    /// Nothing to do
    Idle,
}

/// Picks the reconcile action. The first matching rule wins.
pub fn decide(counts: &IpPoolCounts, spec: &NodeNetworkConfigSpec, scaler: &Scaler) -> PoolAction {
    let requested = spec.requested_ip_count;
    let free = requested.saturating_sub(counts.allocated as i64);

    if free < calculate_min_free_ips(scaler) && requested != scaler.max_ip_count {
        PoolAction::Increase
    } else if free >= calculate_max_free_ips(scaler) {
        PoolAction::Decrease
    } else if spec.ips_not_in_use.len() != counts.pending_release {
        PoolAction::CleanPendingRelease
    } else {
        PoolAction::Idle
    }
}

/// Point-in-time view of the monitor, for debugging endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMonitorStateSnapshot {
    /// Request threshold for the cached scaler
    pub minimum_free_ips: i64,
    /// Release threshold for the cached scaler
    pub maximum_free_ips: i64,
    /// IPs marked for release whose spec write has not gone through
    pub updating_ips_not_in_use_count: usize,
    /// Last NodeNetworkConfig received, with the last spec written
    #[serde(rename = "cachedNNC")]
    pub cached_nnc: NodeNetworkConfig,
    /// When the snapshot was published
    pub taken_at: DateTime<Utc>,
}

type StateSnapshot = Option<PoolMonitorStateSnapshot>;

enum Wake {
    Tick,
    Status(NodeNetworkConfig),
    SourceClosed,
}

/// The monitor loop. Consumed by `start`.
pub struct Monitor {
    source: Arc<dyn IpPoolSnapshotSource>,
    updater: Arc<dyn NodeNetworkConfigSpecUpdater>,
    metrics: Arc<dyn PoolMetrics>,
    options: MonitorOptions,
    nnc: Option<NodeNetworkConfig>,
    updating_ips_not_in_use_count: usize,
    nnc_source: mpsc::Receiver<NodeNetworkConfig>,
    state_tx: watch::Sender<StateSnapshot>,
}

/// Cloneable entry point into a running monitor
#[derive(Clone)]
pub struct MonitorHandle {
    source: Arc<dyn IpPoolSnapshotSource>,
    metrics: Arc<dyn PoolMetrics>,
    nnc_tx: mpsc::Sender<NodeNetworkConfig>,
    state_rx: watch::Receiver<StateSnapshot>,
}

impl Monitor {
    /// Creates the monitor and the handle used to feed it.
    ///
    /// Nothing runs until `start` is awaited.
    pub fn new(
        source: Arc<dyn IpPoolSnapshotSource>,
        updater: Arc<dyn NodeNetworkConfigSpecUpdater>,
        metrics: Arc<dyn PoolMetrics>,
        mut options: MonitorOptions,
    ) -> (Self, MonitorHandle) {
        if options.refresh_delay.is_zero() {
            options.refresh_delay = DEFAULT_REFRESH_DELAY;
        }
        // capacity 1: `update` waits while the loop is busy with the previous status
        let (nnc_tx, nnc_source) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(None);

        let handle = MonitorHandle {
            source: source.clone(),
            metrics: metrics.clone(),
            nnc_tx,
            state_rx,
        };
        let monitor = Self {
            source,
            updater,
            metrics,
            options,
            nnc: None,
            updating_ips_not_in_use_count: 0,
            nnc_source,
            state_tx,
        };
        (monitor, handle)
    }

    /// Runs the monitor until `cancel` fires.
    ///
    /// Refresh ticks are ignored until the first status arrives. Reconcile
    /// errors are logged and left for the next wake-up. Cancellation also
    /// abandons an in-flight spec write.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), MonitorError> {
        info!(
            "Starting IPAM pool monitor (refresh every {:?})",
            self.options.refresh_delay
        );

        let mut ticker = tokio::time::interval(self.options.refresh_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source_open = true;

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("IPAM pool monitor stopping");
                    return Err(MonitorError::Cancelled);
                }
                received = self.nnc_source.recv(), if source_open => match received {
                    Some(nnc) => Wake::Status(nnc),
                    None => Wake::SourceClosed,
                },
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Status(nnc) => self.ingest(nnc),
                Wake::SourceClosed => {
                    debug!("All monitor handles dropped, continuing on refresh ticks only");
                    source_open = false;
                    continue;
                }
                Wake::Tick => {}
            }
            if self.nnc.is_none() {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("IPAM pool monitor stopping");
                    return Err(MonitorError::Cancelled);
                }
                result = self.reconcile() => {
                    if let Err(e) = result {
                        error!("IPAM pool reconcile failed: {}", e);
                    }
                }
            }
            self.publish_state();
        }
    }

    fn ingest(&mut self, nnc: NodeNetworkConfig) {
        debug!(
            "Received NodeNetworkConfig: requested={}, ipsNotInUse={}",
            nnc.spec.requested_ip_count,
            nnc.spec.ips_not_in_use.len()
        );
        self.nnc = Some(nnc);
        self.publish_state();
    }

    fn publish_state(&self) {
        let snapshot = self.state_snapshot();
        self.state_tx.send_replace(snapshot);
    }

    fn state_snapshot(&self) -> StateSnapshot {
        let nnc = self.nnc.as_ref()?;
        let scaler = nnc.scaler();
        Some(PoolMonitorStateSnapshot {
            minimum_free_ips: calculate_min_free_ips(&scaler),
            maximum_free_ips: calculate_max_free_ips(&scaler),
            updating_ips_not_in_use_count: self.updating_ips_not_in_use_count,
            cached_nnc: nnc.clone(),
            taken_at: Utc::now(),
        })
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn reconcile(&mut self) -> Result<(), MonitorError> {
        let Some(nnc) = self.nnc.as_ref() else {
            return Ok(());
        };
        let spec = nnc.spec.clone();
        let scaler = nnc.scaler();
        let counts = self.source.pool_counts();
        let requested = spec.requested_ip_count;
        let free = requested.saturating_sub(counts.allocated as i64);

        self.metrics.observe_pool_state(&PoolStateObservation {
            allocated: counts.allocated as i64,
            available: counts.available as i64,
            batch_size: scaler.batch_size,
            free,
            total: counts.total as i64,
            max_ip_count: scaler.max_ip_count,
            pending_programming: counts.pending_programming as i64,
            pending_release: counts.pending_release as i64,
            requested,
            unallocated: counts.unallocated() as i64,
        });

        let pool = format!(
            "pool size: {}, goal size: {}, batch size: {}, max IP count: {}, allocated: {}, available: {}, pending release: {}, free: {}, pending programming: {}",
            counts.total,
            requested,
            scaler.batch_size,
            scaler.max_ip_count,
            counts.allocated,
            counts.available,
            counts.pending_release,
            free,
            counts.pending_programming
        );

        match decide(&counts, &spec, &scaler) {
            PoolAction::Increase => {
                info!("Increasing pool size, {}", pool);
                self.increase_pool_size(&spec, &scaler).await
            }
            PoolAction::Decrease => {
                info!("Decreasing pool size, {}", pool);
                self.decrease_pool_size(&spec, &scaler, counts.pending_release)
                    .await
            }
            PoolAction::CleanPendingRelease => {
                info!("Removing pending release IPs from the spec, {}", pool);
                self.clean_pending_release(&spec).await
            }
            PoolAction::Idle if counts.allocated == 0 => {
                debug!("No pods scheduled, {}", pool);
                Ok(())
            }
            PoolAction::Idle => {
                debug!("Pool within thresholds, {}", pool);
                Ok(())
            }
        }
    }

    fn candidate_spec(&self, requested_ip_count: i64) -> NodeNetworkConfigSpec {
        build_spec(requested_ip_count, &self.source.pending_release_ip_configs())
    }

    fn cache_spec(&mut self, spec: NodeNetworkConfigSpec) {
        if let Some(nnc) = self.nnc.as_mut() {
            nnc.spec = spec;
        }
    }

    async fn increase_pool_size(
        &mut self,
        cached: &NodeNetworkConfigSpec,
        scaler: &Scaler,
    ) -> Result<(), MonitorError> {
        let previously_requested = cached.requested_ip_count;
        let mut candidate = self.candidate_spec(previously_requested);

        candidate.requested_ip_count = candidate
            .requested_ip_count
            .saturating_add(scaler.batch_size);
        if candidate.requested_ip_count > scaler.max_ip_count {
            info!(
                "Requested IP count {} is over the max IP count {}, requesting the max instead",
                candidate.requested_ip_count, scaler.max_ip_count
            );
            candidate.requested_ip_count = scaler.max_ip_count;
        }

        if candidate.requested_ip_count == previously_requested {
            debug!(
                "Requested IP count {} is unchanged, nothing to do",
                previously_requested
            );
            return Ok(());
        }

        self.updater.update_spec(&candidate).await?;

        info!(
            "Pool increase requested: requested={}, ipsNotInUse={}",
            candidate.requested_ip_count,
            candidate.ips_not_in_use.len()
        );
        self.metrics.start_pool_increase_timer(scaler.batch_size);
        self.cache_spec(candidate);
        Ok(())
    }

    async fn decrease_pool_size(
        &mut self,
        cached: &NodeNetworkConfigSpec,
        scaler: &Scaler,
        existing_pending_release: usize,
    ) -> Result<(), MonitorError> {
        let previously_requested = cached.requested_ip_count;
        let batch_size = scaler.batch_size.max(1);

        // land on a batch multiple: 25 -> 20, 30 -> 20 for a batch of 10
        let remainder = previously_requested % batch_size;
        let updated_requested = if remainder != 0 {
            previously_requested.saturating_sub(remainder)
        } else {
            previously_requested.saturating_sub(batch_size)
        };
        let decrease_by = previously_requested.saturating_sub(updated_requested);

        debug!(
            "Decrease: previously requested={}, batch size={}, target={}",
            previously_requested, batch_size, updated_requested
        );

        // Only mark new IPs when no earlier release is still unconfirmed,
        // otherwise a failed spec write followed by a retry would release twice.
        let newly_marked = if self.updating_ips_not_in_use_count == 0
            || self.updating_ips_not_in_use_count < existing_pending_release
        {
            let count = usize::try_from(decrease_by).unwrap_or(0);
            info!("Marking {} IPs as pending release", count);
            Some(self.source.mark_ip_as_pending_release(count)?)
        } else {
            None
        };

        let mut candidate = self.candidate_spec(previously_requested);
        let released = match &newly_marked {
            Some(marked) if marked.is_empty() => {
                self.updating_ips_not_in_use_count = 0;
                0
            }
            Some(marked) => {
                self.updating_ips_not_in_use_count = candidate.ips_not_in_use.len();
                marked.len()
            }
            // Retrying a release whose spec write failed. The marked IPs may
            // already sit in the cached ipsNotInUse (a cleanup wrote them), so
            // the step is taken from the batch target, not from new IDs.
            None => usize::try_from(decrease_by)
                .unwrap_or(0)
                .min(candidate.ips_not_in_use.len()),
        };
        candidate.requested_ip_count = candidate
            .requested_ip_count
            .saturating_sub(released as i64);

        debug!(
            "Releasing {} IPs in this batch, {} pending release IPs in flight",
            released, self.updating_ips_not_in_use_count
        );

        self.updater.update_spec(&candidate).await?;

        info!(
            "Pool decrease requested: requested={}, ipsNotInUse={}",
            candidate.requested_ip_count,
            candidate.ips_not_in_use.len()
        );
        self.metrics.start_pool_decrease_timer(batch_size);
        self.cache_spec(candidate);
        if released > 0 {
            self.updating_ips_not_in_use_count = 0;
        }
        Ok(())
    }

    async fn clean_pending_release(
        &mut self,
        cached: &NodeNetworkConfigSpec,
    ) -> Result<(), MonitorError> {
        let candidate = self.candidate_spec(cached.requested_ip_count);
        self.updater.update_spec(&candidate).await?;

        info!(
            "Pending release IPs cleaned: requested={}, ipsNotInUse={}",
            candidate.requested_ip_count,
            candidate.ips_not_in_use.len()
        );
        self.cache_spec(candidate);
        Ok(())
    }
}

impl MonitorHandle {
    /// Hands a fresh NodeNetworkConfig to the monitor.
    ///
    /// The scaler is clamped first. If the status shows the pool has settled
    /// at the requested size, any outstanding scale timer is observed. Waits
    /// while the monitor is still busy with the previous status.
    pub async fn update(&self, mut nnc: NodeNetworkConfig) -> Result<(), MonitorError> {
        clamp_node_network_config(&mut nnc);

        let counts = self.source.pool_counts();
        let usable = counts.total.saturating_sub(counts.pending_release);
        if nnc.spec.requested_ip_count == usable as i64 {
            self.metrics.observe_pool_scale_latency();
        }

        self.nnc_tx
            .send(nnc)
            .await
            .map_err(|_| MonitorError::Stopped)
    }

    /// Latest monitor state, or `None` before the first status
    pub fn state_snapshot(&self) -> Option<PoolMonitorStateSnapshot> {
        self.state_rx.borrow().clone()
    }

    /// Watch that changes whenever the monitor publishes new state
    pub fn subscribe(&self) -> watch::Receiver<Option<PoolMonitorStateSnapshot>> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
#[path = "monitor_test.rs"]
mod monitor_test;
