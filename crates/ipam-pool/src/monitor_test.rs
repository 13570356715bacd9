//! Unit tests for the pool monitor

use super::*;
use crate::fake::FakeRequestController;
use crate::metrics::NoopMetrics;
use crate::store::IpConfigStore;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

struct TestState {
    batch_size: i64,
    ip_config_count: usize,
    allocated: usize,
    request_threshold_percent: i64,
    release_threshold_percent: i64,
    max_ip_count: i64,
}

impl TestState {
    fn new(batch_size: i64, ip_config_count: usize, allocated: usize) -> Self {
        Self {
            batch_size,
            ip_config_count,
            allocated,
            request_threshold_percent: 50,
            release_threshold_percent: 150,
            max_ip_count: 30,
        }
    }

    fn thresholds(mut self, request: i64, release: i64) -> Self {
        self.request_threshold_percent = request;
        self.release_threshold_percent = release;
        self
    }

    fn scaler(&self) -> Scaler {
        Scaler {
            batch_size: self.batch_size,
            request_threshold_percent: self.request_threshold_percent,
            release_threshold_percent: self.release_threshold_percent,
            max_ip_count: self.max_ip_count,
        }
    }
}

struct Fixture {
    store: Arc<IpConfigStore>,
    rc: Arc<FakeRequestController>,
    monitor: Monitor,
    handle: MonitorHandle,
}

fn init_fakes_with_metrics(state: TestState, metrics: Arc<dyn PoolMetrics>) -> Fixture {
    let store = Arc::new(IpConfigStore::new());
    let rc = Arc::new(FakeRequestController::new(
        store.clone(),
        state.scaler(),
        state.ip_config_count,
    ));
    let (monitor, handle) = Monitor::new(
        store.clone(),
        rc.clone(),
        metrics,
        MonitorOptions {
            refresh_delay: Duration::from_secs(100),
        },
    );
    store.set_allocated_count(state.allocated).unwrap();
    Fixture {
        store,
        rc,
        monitor,
        handle,
    }
}

fn init_fakes(state: TestState) -> Fixture {
    init_fakes_with_metrics(state, Arc::new(NoopMetrics))
}

impl Fixture {
    /// DNC reconciles and the new object reaches the monitor
    fn dnc_reconcile(&mut self, remove_pending_release: bool) {
        let nnc = self.rc.reconcile(remove_pending_release);
        self.push(nnc);
    }

    fn push(&mut self, mut nnc: NodeNetworkConfig) {
        clamp_node_network_config(&mut nnc);
        self.monitor.ingest(nnc);
    }

    async fn reconcile(&mut self) {
        self.monitor.reconcile().await.unwrap();
    }

    async fn reconcile_and_validate(&mut self, requested: i64, not_in_use: usize) {
        self.reconcile().await;
        assert_eq!(self.requested(), requested, "requested IP count");
        assert_eq!(self.not_in_use(), not_in_use, "IPs not in use");
    }

    fn requested(&self) -> i64 {
        self.cached_spec().requested_ip_count
    }

    fn not_in_use(&self) -> usize {
        self.cached_spec().ips_not_in_use.len()
    }

    fn cached_spec(&self) -> &NodeNetworkConfigSpec {
        &self.monitor.nnc.as_ref().unwrap().spec
    }
}

#[tokio::test]
async fn test_pool_size_increase() {
    let mut f = init_fakes(TestState::new(10, 10, 8));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.requested(), 20);

    // DNC carves the new batch; the pool is now inside the thresholds
    f.dnc_reconcile(true);
    f.reconcile().await;

    assert_eq!(f.requested(), 20);
    assert_eq!(f.store.pool_counts().total, 20);
    assert_eq!(f.rc.update_calls(), 1);
}

#[tokio::test]
async fn test_increase_does_not_change_when_increase_in_progress() {
    let mut f = init_fakes(TestState::new(10, 10, 8).thresholds(30, 150));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.requested(), 20);

    // still short of IPs, but the previous request already covers it
    f.store.set_allocated_count(9).unwrap();
    f.reconcile().await;
    assert_eq!(f.requested(), 20);

    f.dnc_reconcile(true);
    f.reconcile().await;

    assert_eq!(f.store.pool_counts().total, 20);
    assert_eq!(f.requested(), 20);
    assert_eq!(f.rc.update_calls(), 1);
}

#[tokio::test]
async fn test_pool_size_increase_idempotency() {
    let mut f = init_fakes(TestState::new(10, 10, 8).thresholds(30, 150));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.requested(), 20);

    f.reconcile().await;
    assert_eq!(f.requested(), 20);
    assert_eq!(f.rc.update_calls(), 1);
}

#[tokio::test]
async fn test_pool_increase_past_node_limit() {
    let mut f = init_fakes(TestState::new(16, 16, 9));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.requested(), 30);
}

#[tokio::test]
async fn test_pool_increase_batch_size_greater_than_max_ip_count() {
    let mut f = init_fakes(TestState::new(50, 16, 16));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.requested(), 30);

    // at the node limit: a second reconcile must not write again
    f.reconcile().await;
    assert_eq!(f.requested(), 30);
    assert_eq!(f.rc.update_calls(), 1);
}

#[tokio::test]
async fn test_pool_decrease() {
    let mut f = init_fakes(TestState::new(10, 20, 15));
    f.dnc_reconcile(true);

    // inside the thresholds
    f.reconcile().await;
    assert_eq!(f.rc.update_calls(), 0);

    f.store.set_allocated_count(4).unwrap();
    f.reconcile_and_validate(10, 10).await;
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);

    f.dnc_reconcile(true);
    assert!(f.store.pending_release_ip_configs().is_empty());
    assert_eq!(f.store.pool_counts().total, 10);

    // convergence: the reclaimed IPs are cleared from the spec
    f.reconcile_and_validate(10, 0).await;
}

#[tokio::test]
async fn test_pool_size_decrease_when_decrease_has_already_been_requested() {
    let mut f = init_fakes(TestState::new(10, 20, 5).thresholds(30, 100));
    f.dnc_reconcile(true);

    f.reconcile_and_validate(10, 10).await;

    // pods come and go before DNC catches up; the spec is untouched
    f.store.set_allocated_count(6).unwrap();
    assert_eq!(f.requested(), 10);
    assert_eq!(f.not_in_use(), 10);

    f.dnc_reconcile(true);
    f.reconcile_and_validate(10, 0).await;
}

#[tokio::test]
async fn test_decrease_and_increase_to_same_count() {
    let mut f = init_fakes(TestState::new(10, 10, 7));
    f.dnc_reconcile(true);

    f.reconcile_and_validate(20, 0).await;

    f.dnc_reconcile(true);
    f.store.set_allocated_count(0).unwrap();
    f.reconcile_and_validate(10, 10).await;

    // back up before DNC has reclaimed the released batch
    f.store.set_allocated_count(7).unwrap();
    f.reconcile_and_validate(20, 10).await;

    // DNC carves without reclaiming
    f.dnc_reconcile(false);
    f.reconcile_and_validate(20, 10).await;

    f.dnc_reconcile(true);
    f.reconcile_and_validate(20, 0).await;
    f.reconcile_and_validate(20, 0).await;
}

#[tokio::test]
async fn test_pool_size_decrease_to_really_low() {
    let mut f = init_fakes(TestState::new(10, 30, 23).thresholds(30, 100));
    f.dnc_reconcile(true);

    f.reconcile().await;
    assert_eq!(f.rc.update_calls(), 0);

    // releases in two batches
    f.store.set_allocated_count(3).unwrap();
    f.reconcile_and_validate(20, 10).await;
    f.reconcile_and_validate(10, 20).await;
    assert_eq!(f.store.pending_release_ip_configs().len(), 20);

    f.dnc_reconcile(true);
    f.reconcile_and_validate(10, 0).await;
}

#[tokio::test]
async fn test_decrease_after_node_limit_reached() {
    let mut f = init_fakes(TestState::new(16, 30, 20));
    f.dnc_reconcile(true);

    f.reconcile().await;

    f.store.set_allocated_count(5).unwrap();
    // 30 is not a batch multiple, so only 30 % 16 are released
    f.reconcile_and_validate(16, 14).await;
}

#[tokio::test]
async fn test_pool_decrease_batch_size_greater_than_max_ip_count() {
    let mut f = init_fakes(TestState::new(31, 30, 30));
    f.dnc_reconcile(true);

    f.reconcile().await;

    f.store.set_allocated_count(1).unwrap();
    f.reconcile().await;

    assert_eq!(f.requested(), 30);
    assert_eq!(f.rc.update_calls(), 0);
}

#[tokio::test]
async fn test_failed_decrease_does_not_release_twice() {
    let mut f = init_fakes(TestState::new(10, 20, 4));
    f.dnc_reconcile(true);

    f.rc.fail_next_updates(1);
    let err = f.monitor.reconcile().await.unwrap_err();
    assert!(matches!(err, MonitorError::UpdateSpec(_)));

    // the cache is untouched but the IPs are already pending release
    assert_eq!(f.requested(), 20);
    assert_eq!(f.not_in_use(), 0);
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);
    assert_eq!(f.monitor.updating_ips_not_in_use_count, 10);

    // the retry reuses the marked IPs
    f.reconcile_and_validate(10, 10).await;
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);
    assert_eq!(f.monitor.updating_ips_not_in_use_count, 0);
    assert_eq!(f.rc.update_calls(), 2);
}

#[tokio::test]
async fn test_failed_increase_leaves_cache_unchanged() {
    let mut f = init_fakes(TestState::new(10, 10, 8));
    f.dnc_reconcile(true);

    f.rc.fail_next_updates(1);
    assert!(f.monitor.reconcile().await.is_err());
    assert_eq!(f.requested(), 10);

    f.reconcile_and_validate(20, 0).await;
    assert_eq!(f.rc.nnc().spec.requested_ip_count, 20);
}

#[tokio::test]
async fn test_clean_pending_release_with_no_pods() {
    let mut f = init_fakes(TestState::new(10, 10, 0));
    let mut nnc = f.rc.reconcile(true);
    nnc.spec.ips_not_in_use = vec!["already-reclaimed".to_string()];
    f.push(nnc);

    f.reconcile_and_validate(10, 0).await;
    assert_eq!(f.rc.update_calls(), 1);
}

#[tokio::test]
async fn test_no_pods_scheduled_is_idle() {
    let mut f = init_fakes(TestState::new(10, 10, 0));
    f.dnc_reconcile(true);

    f.reconcile_and_validate(10, 0).await;
    assert_eq!(f.rc.update_calls(), 0);
}

#[tokio::test]
async fn test_state_snapshot_tracks_cache() {
    let mut f = init_fakes(TestState::new(10, 10, 8));
    assert!(f.handle.state_snapshot().is_none());

    f.dnc_reconcile(true);
    f.reconcile().await;
    f.monitor.publish_state();

    let snapshot = f.handle.state_snapshot().unwrap();
    assert_eq!(snapshot.minimum_free_ips, 5);
    assert_eq!(snapshot.maximum_free_ips, 15);
    assert_eq!(snapshot.updating_ips_not_in_use_count, 0);
    assert_eq!(snapshot.cached_nnc.spec.requested_ip_count, 20);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["cachedNNC"]["spec"]["requestedIPCount"], 20);
    assert_eq!(json["minimumFreeIps"], 5);
}

fn counts(allocated: usize, pending_release: usize) -> IpPoolCounts {
    IpPoolCounts {
        allocated,
        pending_release,
        ..Default::default()
    }
}

fn spec(requested: i64, not_in_use: usize) -> NodeNetworkConfigSpec {
    NodeNetworkConfigSpec {
        requested_ip_count: requested,
        ips_not_in_use: (0..not_in_use).map(|i| format!("ip-{}", i)).collect(),
    }
}

#[test]
fn test_decide_negative_free_increases() {
    let scaler = TestState::new(10, 0, 0).scaler();
    assert_eq!(decide(&counts(12, 0), &spec(10, 0), &scaler), PoolAction::Increase);
}

#[test]
fn test_decide_at_max_falls_through() {
    let scaler = TestState::new(10, 0, 0).scaler();
    assert_eq!(decide(&counts(29, 0), &spec(30, 0), &scaler), PoolAction::Idle);
    assert_eq!(
        decide(&counts(29, 2), &spec(30, 0), &scaler),
        PoolAction::CleanPendingRelease
    );
}

#[test]
fn test_decide_release_threshold_is_inclusive() {
    let scaler = TestState::new(10, 0, 0).scaler();
    assert_eq!(decide(&counts(5, 0), &spec(20, 0), &scaler), PoolAction::Decrease);
    assert_eq!(decide(&counts(6, 0), &spec(20, 0), &scaler), PoolAction::Idle);
}

#[test]
fn test_decide_cleanup_before_zero_pods() {
    let scaler = TestState::new(10, 0, 0).scaler();
    assert_eq!(
        decide(&counts(0, 0), &spec(10, 3), &scaler),
        PoolAction::CleanPendingRelease
    );
    assert_eq!(decide(&counts(0, 0), &spec(10, 0), &scaler), PoolAction::Idle);
}

#[derive(Default)]
struct RecordingMetrics {
    increase_timers: AtomicUsize,
    decrease_timers: AtomicUsize,
    latency_observations: AtomicUsize,
    last_state: Mutex<Option<PoolStateObservation>>,
}

impl PoolMetrics for RecordingMetrics {
    fn observe_pool_state(&self, observation: &PoolStateObservation) {
        *self.last_state.lock().unwrap() = Some(*observation);
    }

    fn start_pool_increase_timer(&self, _batch_size: i64) {
        self.increase_timers.fetch_add(1, Ordering::SeqCst);
    }

    fn start_pool_decrease_timer(&self, _batch_size: i64) {
        self.decrease_timers.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_pool_scale_latency(&self) {
        self.latency_observations.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_metrics_recorded_through_scale_up() {
    let metrics = Arc::new(RecordingMetrics::default());
    let mut f = init_fakes_with_metrics(TestState::new(10, 10, 8), metrics.clone());
    f.dnc_reconcile(true);

    f.reconcile().await;

    let state = metrics.last_state.lock().unwrap().unwrap();
    assert_eq!(state.allocated, 8);
    assert_eq!(state.free, 2);
    assert_eq!(state.requested, 10);
    assert_eq!(state.batch_size, 10);
    assert_eq!(state.unallocated, 2);
    assert_eq!(metrics.increase_timers.load(Ordering::SeqCst), 1);

    // DNC delivers the batch: requested now matches the usable pool
    let nnc = f.rc.reconcile(true);
    f.handle.update(nnc).await.unwrap();
    assert_eq!(metrics.latency_observations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_metrics_decrease_timer() {
    let metrics = Arc::new(RecordingMetrics::default());
    let mut f = init_fakes_with_metrics(TestState::new(10, 20, 4), metrics.clone());
    f.dnc_reconcile(true);

    f.reconcile().await;

    assert_eq!(metrics.decrease_timers.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.increase_timers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_returns_on_cancel() {
    let f = init_fakes(TestState::new(10, 10, 8));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(f.monitor.start(cancel.clone()));

    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(MonitorError::Cancelled)));
}

#[tokio::test]
async fn test_update_drives_reconcile() {
    let f = init_fakes(TestState::new(10, 10, 8));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(f.monitor.start(cancel.clone()));

    f.handle.update(f.rc.reconcile(true)).await.unwrap();

    let mut state = f.handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| {
            s.as_ref()
                .is_some_and(|s| s.cached_nnc.spec.requested_ip_count == 20)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(f.rc.nnc().spec.requested_ip_count, 20);
    assert_eq!(f.rc.update_calls(), 1);

    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(MonitorError::Cancelled)));
}

#[tokio::test]
async fn test_update_clamps_scaler() {
    let f = init_fakes(TestState::new(50, 16, 16));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(f.monitor.start(cancel.clone()));

    f.handle.update(f.rc.reconcile(true)).await.unwrap();

    let mut state = f.handle.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), state.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(snapshot.cached_nnc.scaler().batch_size, 30);
    assert_eq!(snapshot.minimum_free_ips, 15);

    cancel.cancel();
    let _ = task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ticks_before_first_status_do_nothing() {
    let f = init_fakes(TestState::new(10, 10, 8));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(f.monitor.start(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(500)).await;

    assert_eq!(f.rc.update_calls(), 0);
    assert!(f.handle.state_snapshot().is_none());

    cancel.cancel();
    let _ = task.await.unwrap();
}

#[tokio::test]
async fn test_update_after_monitor_dropped() {
    let f = init_fakes(TestState::new(10, 10, 8));
    drop(f.monitor);

    let err = f.handle.update(f.rc.nnc()).await.unwrap_err();
    assert!(matches!(err, MonitorError::Stopped));
}

#[test]
fn test_zero_refresh_delay_uses_default() {
    let store = Arc::new(IpConfigStore::new());
    let rc = Arc::new(FakeRequestController::new(
        store.clone(),
        TestState::new(10, 0, 0).scaler(),
        0,
    ));
    let (monitor, _handle) = Monitor::new(
        store,
        rc,
        Arc::new(NoopMetrics),
        MonitorOptions {
            refresh_delay: Duration::ZERO,
        },
    );
    assert_eq!(monitor.options.refresh_delay, DEFAULT_REFRESH_DELAY);
}

#[tokio::test]
async fn test_extreme_requested_count_does_not_overflow() {
    let mut f = init_fakes(TestState::new(10, 10, 1));
    f.dnc_reconcile(true);

    let mut nnc = f.rc.nnc();
    nnc.spec.requested_ip_count = i64::MIN;
    f.push(nnc);
    f.reconcile().await;
    assert_eq!(f.requested(), i64::MIN + 10);

    let mut nnc = f.rc.nnc();
    nnc.spec.requested_ip_count = i64::MAX;
    f.push(nnc);
    f.reconcile().await;
    // 7 is the distance to the batch multiple below i64::MAX
    assert_eq!(f.requested(), i64::MAX - 7);
    assert_eq!(f.store.pending_release_ip_configs().len(), 7);
}

#[tokio::test]
async fn test_decrease_retry_after_cleanup_stays_batch_aligned() {
    let mut f = init_fakes(TestState::new(10, 20, 4));
    f.dnc_reconcile(true);

    f.rc.fail_next_updates(1);
    assert!(f.monitor.reconcile().await.is_err());
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);

    // free drops under the release threshold, so the next pass only cleans up
    f.store.set_allocated_count(6).unwrap();
    f.reconcile_and_validate(20, 10).await;
    assert_eq!(f.monitor.updating_ips_not_in_use_count, 10);

    // the retried decrease lands on the batch target without marking more
    f.store.set_allocated_count(4).unwrap();
    f.reconcile_and_validate(10, 10).await;
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);
    assert_eq!(f.monitor.updating_ips_not_in_use_count, 0);

    f.reconcile_and_validate(10, 10).await;
    assert_eq!(f.requested() % 10, 0);
    assert_eq!(f.store.pending_release_ip_configs().len(), 10);
    assert_eq!(f.rc.update_calls(), 3);
}

/// Spec updater whose writes never complete
struct BlockingUpdater {
    entered: tokio::sync::Notify,
}

#[async_trait::async_trait]
impl NodeNetworkConfigSpecUpdater for BlockingUpdater {
    async fn update_spec(
        &self,
        _spec: &NodeNetworkConfigSpec,
    ) -> Result<NodeNetworkConfig, crate::error::SpecUpdateError> {
        self.entered.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_spec_write() {
    let store = Arc::new(IpConfigStore::new());
    let rc = FakeRequestController::new(store.clone(), TestState::new(10, 10, 8).scaler(), 10);
    store.set_allocated_count(8).unwrap();
    let updater = Arc::new(BlockingUpdater {
        entered: tokio::sync::Notify::new(),
    });
    let (monitor, handle) = Monitor::new(
        store,
        updater.clone(),
        Arc::new(NoopMetrics),
        MonitorOptions::default(),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(monitor.start(cancel.clone()));

    handle.update(rc.reconcile(true)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), updater.entered.notified())
        .await
        .unwrap();

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(MonitorError::Cancelled)));
}
