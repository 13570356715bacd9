//! Pool metrics recorder
//!
//! The monitor reports through the `PoolMetrics` trait so the binary decides
//! which registry the series land in and tests can run without one.
//!
//! Scale latency is approximate. DNC gives no way to correlate a spec write
//! with the status that satisfies it, so a timer is started when the monitor
//! writes a new requested count and stopped by the next status whose
//! requested count matches the usable pool. While a timer is outstanding,
//! starting another one does nothing, so the longest span is the one kept.

use prometheus::{HistogramOpts, HistogramVec, IntGauge, Registry};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Gauge values recorded on every reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStateObservation {
    /// IPs assigned to pods
    pub allocated: i64,
    /// IPs free to hand out
    pub available: i64,
    /// Scaler batch size
    pub batch_size: i64,
    /// Requested IPs not assigned to pods; negative while an increase is pending
    pub free: i64,
    /// IPs DNC has provisioned
    pub total: i64,
    /// Scaler max IP count
    pub max_ip_count: i64,
    /// IPs waiting to be programmed
    pub pending_programming: i64,
    /// IPs given back and not yet reclaimed
    pub pending_release: i64,
    /// `requestedIPCount` from the cached spec
    pub requested: i64,
    /// Provisioned IPs not assigned to pods
    pub unallocated: i64,
}

/// Metrics sink for the pool monitor
pub trait PoolMetrics: Send + Sync {
    /// Sets the pool gauges
    fn observe_pool_state(&self, observation: &PoolStateObservation);

    /// Records the start of a pool increase, unless one is already outstanding
    fn start_pool_increase_timer(&self, batch_size: i64);

    /// Records the start of a pool decrease, unless one is already outstanding
    fn start_pool_decrease_timer(&self, batch_size: i64);

    /// Observes and clears any outstanding increase and decrease timers
    fn observe_pool_scale_latency(&self);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl PoolMetrics for NoopMetrics {
    fn observe_pool_state(&self, _observation: &PoolStateObservation) {}
    fn start_pool_increase_timer(&self, _batch_size: i64) {}
    fn start_pool_decrease_timer(&self, _batch_size: i64) {}
    fn observe_pool_scale_latency(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct ScaleEvent {
    start: Instant,
    batch_size: i64,
}

/// Prometheus-backed recorder
pub struct PrometheusMetrics {
    allocated_ips: IntGauge,
    available_ips: IntGauge,
    batch_size: IntGauge,
    free_ips: IntGauge,
    total_ips: IntGauge,
    max_ips: IntGauge,
    pending_programming_ips: IntGauge,
    pending_release_ips: IntGauge,
    requested_ips: IntGauge,
    unallocated_ips: IntGauge,
    inc_latency: HistogramVec,
    dec_latency: HistogramVec,
    inc_event: Mutex<Option<ScaleEvent>>,
    dec_event: Mutex<Option<ScaleEvent>>,
}

impl PrometheusMetrics {
    /// Creates the series and registers them in `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let latency = |name: &str, help: &str| -> Result<HistogramVec, prometheus::Error> {
            // 50ms to ~800s
            let buckets = prometheus::exponential_buckets(0.05, 2.0, 15)?;
            let histogram =
                HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), &["batch"])?;
            registry.register(Box::new(histogram.clone()))?;
            Ok(histogram)
        };

        Ok(Self {
            allocated_ips: gauge("cx_ipam_pod_allocated_ips", "Count of IPs allocated to pods")?,
            available_ips: gauge("cx_ipam_available_ips", "Available IP count")?,
            batch_size: gauge("cx_ipam_batch_size", "IPAM IP pool batch size")?,
            free_ips: gauge("cx_ipam_free_ips", "Requested IPs not allocated to pods")?,
            total_ips: gauge("cx_ipam_total_ips", "Count of total IP pool size provisioned by DNC")?,
            max_ips: gauge("cx_ipam_max_ips", "Maximum IP count")?,
            pending_programming_ips: gauge(
                "cx_ipam_pending_programming_ips",
                "Pending programming IP count",
            )?,
            pending_release_ips: gauge("cx_ipam_pending_release_ips", "Pending release IP count")?,
            requested_ips: gauge("cx_ipam_requested_ips", "Requested IP count")?,
            unallocated_ips: gauge("cx_ipam_unallocated_ips", "Pool IPs not allocated to pods")?,
            inc_latency: latency(
                "ip_pool_inc_latency_seconds",
                "IP pool size increase latency in seconds by batch size",
            )?,
            dec_latency: latency(
                "ip_pool_dec_latency_seconds",
                "IP pool size decrease latency in seconds by batch size",
            )?,
            inc_event: Mutex::new(None),
            dec_event: Mutex::new(None),
        })
    }

    fn start_timer(slot: &Mutex<Option<ScaleEvent>>, batch_size: i64) {
        let mut event = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if event.is_none() {
            *event = Some(ScaleEvent {
                start: Instant::now(),
                batch_size,
            });
        }
    }

    fn observe_timer(slot: &Mutex<Option<ScaleEvent>>, histogram: &HistogramVec) {
        let event = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(event) = event {
            histogram
                .with_label_values(&[event.batch_size.to_string().as_str()])
                .observe(event.start.elapsed().as_secs_f64());
        }
    }
}

impl PoolMetrics for PrometheusMetrics {
    fn observe_pool_state(&self, o: &PoolStateObservation) {
        self.allocated_ips.set(o.allocated);
        self.available_ips.set(o.available);
        self.batch_size.set(o.batch_size);
        self.free_ips.set(o.free);
        self.total_ips.set(o.total);
        self.max_ips.set(o.max_ip_count);
        self.pending_programming_ips.set(o.pending_programming);
        self.pending_release_ips.set(o.pending_release);
        self.requested_ips.set(o.requested);
        self.unallocated_ips.set(o.unallocated);
    }

    fn start_pool_increase_timer(&self, batch_size: i64) {
        Self::start_timer(&self.inc_event, batch_size);
    }

    fn start_pool_decrease_timer(&self, batch_size: i64) {
        Self::start_timer(&self.dec_event, batch_size);
    }

    fn observe_pool_scale_latency(&self) {
        Self::observe_timer(&self.inc_event, &self.inc_latency);
        Self::observe_timer(&self.dec_event, &self.dec_latency);
    }
}
