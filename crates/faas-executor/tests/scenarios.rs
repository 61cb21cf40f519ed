//! End-to-end dispatcher scenarios (spec §8, S1-S6), driven against the
//! process-backed reference `InstanceManager` rather than a real unikernel.
//!
//! Grounded on `faas-executor/tests/integration_tests.rs`'s structure:
//! one `#[tokio::test]` per named scenario, asserting on the observable
//! `InvocationResult` and the session's wire trace.

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faas_common::{ExecStatus, Invocation};
use faas_executor::config::EngineConfig;
use faas_executor::dispatcher::CoreDispatcher;
use faas_executor::instance_manager::{Instance, InstanceId, LoadedInstance, ProcessInstanceManager, Snapshot};
use faas_executor::ports::PortRegistry;
use faas_executor::session::{InvocationSession, WireEvent};
use faas_executor::snapshot_cache::SnapshotCache;
use faas_executor::work_queue::WorkQueue;
use faas_executor::{EngineError, InstanceManager};

/// Wraps the reference instance manager to count `load` calls, used by S3
/// and S6 to assert hot reuse never re-clones an instance.
struct CountingInstanceManager {
    inner: ProcessInstanceManager,
    loads: AtomicUsize,
}

impl CountingInstanceManager {
    fn new(base_port: u16) -> Self {
        Self {
            inner: ProcessInstanceManager::new(base_port),
            loads: AtomicUsize::new(0),
        }
    }

    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceManager for CountingInstanceManager {
    async fn load(&self, instance: Instance) -> Result<LoadedInstance, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(instance).await
    }
    async fn start(&self, id: InstanceId) -> Result<(), EngineError> {
        self.inner.start(id).await
    }
    async fn yield_instance(&self, id: InstanceId) -> Result<(), EngineError> {
        self.inner.yield_instance(id).await
    }
    async fn resume(&self, id: InstanceId) -> Result<(), EngineError> {
        self.inner.resume(id).await
    }
    async fn halt(&self, id: InstanceId) -> Result<(), EngineError> {
        self.inner.halt(id).await
    }
    async fn set_checkpoint(&self, id: InstanceId) -> Result<Snapshot, EngineError> {
        self.inner.set_checkpoint(id).await
    }
    fn clone_from(&self, snapshot: &Snapshot) -> Instance {
        self.inner.clone_from(snapshot)
    }
    fn base_instance(&self) -> Instance {
        self.inner.base_instance()
    }
}

/// Boots the embedded base image to its init checkpoint, mirroring
/// `bootstrap.rs::Engine::bootstrap` without requiring a full `Engine`.
async fn bootstrap_base(im: &Arc<dyn InstanceManager>, config: &EngineConfig) -> Arc<Snapshot> {
    let loaded = im.load(im.base_instance()).await.unwrap();
    im.start(loaded.id).await.unwrap();

    let checkpoint_fut = im.set_checkpoint(loaded.id);
    let boot_fut = async {
        let mut session = InvocationSession::new(
            "bootstrap",
            loaded.addr,
            config.base_port,
            config.connect_timeout,
            config.invocation_timeout,
        );
        session.connect().await.unwrap();
        session
            .send("/init", "function main(a){return {};}", true)
            .await
            .unwrap();
        session.await_response().await.unwrap();
        session.close().await;
    };
    let (snap, _) = tokio::join!(checkpoint_fut, boot_fut);
    im.halt(loaded.id).await.unwrap();
    Arc::new(snap.unwrap())
}

fn new_engine_config(base_port: u16, hot_cap: usize, reuse_cap: u32) -> Arc<EngineConfig> {
    Arc::new(EngineConfig {
        concur_cap: 1,
        snap_cap: 8,
        hot_cap,
        reuse_cap,
        base_port,
        invocation_timeout: Duration::from_millis(2_000),
        ..Default::default()
    })
}

async fn new_dispatcher(
    config: Arc<EngineConfig>,
    im: Arc<dyn InstanceManager>,
    base_snapshot: Arc<Snapshot>,
) -> Rc<CoreDispatcher> {
    let snapshot_cache = Arc::new(SnapshotCache::new(config.snap_cap));
    let work_queue = Arc::new(WorkQueue::new(1));
    let port_registry = PortRegistry::new();
    CoreDispatcher::new(0, config, im, snapshot_cache, work_queue, port_registry, base_snapshot)
}

#[tokio::test]
async fn s1_cold_start_succeeds_and_publishes_snapshot() {
    let config = new_engine_config(44_000, 0, 16);
    let im: Arc<dyn InstanceManager> = Arc::new(ProcessInstanceManager::new(44_100));
    let base_snapshot = bootstrap_base(&im, &config).await;
    let snapshot_cache = Arc::new(SnapshotCache::new(config.snap_cap));
    let work_queue = Arc::new(WorkQueue::new(1));
    let port_registry = PortRegistry::new();
    let dispatcher = CoreDispatcher::new(
        0,
        config,
        im,
        snapshot_cache.clone(),
        work_queue,
        port_registry,
        base_snapshot,
    );

    let inv = Invocation::new("1", "fn-a", r#"{"k":"v"}"#, "function main(a){return {x:a.k};}");
    let (result, trace) = dispatcher.dispatch_traced(inv).await;

    assert_eq!(
        trace,
        vec![
            WireEvent::Connected,
            WireEvent::Init,
            WireEvent::Initialized,
            WireEvent::Run,
            WireEvent::Executed,
            WireEvent::Closed,
        ]
    );
    assert_eq!(result.info.exec_stats.status, ExecStatus::Success);
    assert_eq!(result.reply, r#"{"x":"v"}"#);
    assert!(snapshot_cache.get(&"fn-a".into()).await.is_some());
}

#[tokio::test]
async fn s2_warm_start_skips_init_and_reuses_the_published_snapshot() {
    let config = new_engine_config(44_200, 0, 16);
    let im: Arc<dyn InstanceManager> = Arc::new(ProcessInstanceManager::new(44_300));
    let base_snapshot = bootstrap_base(&im, &config).await;
    let dispatcher = new_dispatcher(config, im, base_snapshot).await;

    let first = Invocation::new("1", "fn-a", r#"{"k":"v"}"#, "function main(a){return {x:a.k};}");
    let _ = dispatcher.clone().dispatch_traced(first).await;

    let second = Invocation::new("2", "fn-a", r#"{"k":"w"}"#, "");
    let (result, trace) = dispatcher.dispatch_traced(second).await;

    assert_eq!(
        trace,
        vec![WireEvent::Connected, WireEvent::Run, WireEvent::Executed, WireEvent::Closed]
    );
    assert_eq!(result.reply, r#"{"x":"w"}"#);
}

#[tokio::test]
async fn s3_hot_start_reuses_the_same_instance_without_recloning() {
    let config = new_engine_config(44_400, 1, 16);
    let counting = Arc::new(CountingInstanceManager::new(44_500));
    let im: Arc<dyn InstanceManager> = counting.clone();
    let base_snapshot = bootstrap_base(&im, &config).await;
    let loads_after_bootstrap = counting.load_count();
    let dispatcher = new_dispatcher(config, im, base_snapshot).await;

    let first = Invocation::new("1", "fn-a", r#"{"k":"v"}"#, "function main(a){return {x:a.k};}");
    let _ = dispatcher.clone().dispatch_traced(first).await;
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1, "cold start clones once");

    let second = Invocation::new("2", "fn-a", r#"{"k":"w"}"#, "");
    let (_, trace2) = dispatcher.clone().dispatch_traced(second).await;
    assert!(!trace2.contains(&WireEvent::Init));
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1, "hot start never clones");

    let third = Invocation::new("3", "fn-a", r#"{"k":"z"}"#, "");
    let (result, trace3) = dispatcher.dispatch_traced(third).await;
    assert_eq!(
        trace3,
        vec![WireEvent::Connected, WireEvent::Run, WireEvent::Executed, WireEvent::Closed]
    );
    assert_eq!(result.reply, r#"{"x":"z"}"#);
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1, "still the same instance");
}

#[tokio::test]
async fn s4_invocation_timeout_fails_the_request_and_halts_the_instance() {
    let config = Arc::new(EngineConfig {
        concur_cap: 1,
        snap_cap: 8,
        hot_cap: 0,
        reuse_cap: 16,
        base_port: 44_600,
        invocation_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let im: Arc<dyn InstanceManager> = Arc::new(ProcessInstanceManager::new(44_700));
    let base_snapshot = bootstrap_base(&im, &config).await;
    let dispatcher = new_dispatcher(config, im, base_snapshot).await;

    let inv = Invocation::new("4", "fn-b", "{}", "function main(a){while(true){}}");
    let (result, trace) = dispatcher.dispatch_traced(inv).await;

    assert!(trace.contains(&WireEvent::Initialized));
    assert!(!trace.contains(&WireEvent::Executed));
    assert_eq!(result.info.exec_stats.status, ExecStatus::Failure);
    assert_eq!(result.reply, "");
}

#[tokio::test]
async fn s5_protocol_error_fails_the_request_with_the_raw_body() {
    let config = new_engine_config(44_800, 0, 16);
    let im: Arc<dyn InstanceManager> = Arc::new(ProcessInstanceManager::new(44_900));
    let base_snapshot = bootstrap_base(&im, &config).await;
    let dispatcher = new_dispatcher(config, im, base_snapshot).await;

    let inv = Invocation::new("5", "fn-e", "{}", "function main(a){/*FAIL_RUN*/}");
    let (result, trace) = dispatcher.dispatch_traced(inv).await;

    assert_eq!(trace.last(), Some(&WireEvent::Aborted));
    assert_eq!(result.info.exec_stats.status, ExecStatus::Failure);
    assert_eq!(result.reply, r#"{"err":"boom"}"#);
}

#[tokio::test]
async fn s6_reuse_cap_forces_a_warm_start_after_the_cap_is_exceeded() {
    let config = new_engine_config(45_000, 1, 2);
    let counting = Arc::new(CountingInstanceManager::new(45_100));
    let im: Arc<dyn InstanceManager> = counting.clone();
    let base_snapshot = bootstrap_base(&im, &config).await;
    let loads_after_bootstrap = counting.load_count();
    let dispatcher = new_dispatcher(config, im, base_snapshot).await;

    let first = Invocation::new("1", "fn-c", "{}", "function main(a){return {x:a.k};}");
    let _ = dispatcher.clone().dispatch_traced(first).await; // cold, uses -> 1
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1);

    let second = Invocation::new("2", "fn-c", "{}", "");
    let _ = dispatcher.clone().dispatch_traced(second).await; // hot, uses -> 2
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1);

    let third = Invocation::new("3", "fn-c", "{}", "");
    let (third_result, third_trace) = dispatcher.clone().dispatch_traced(third).await; // hot, uses -> 3 > REUSE_CAP, refused
    assert_eq!(third_result.info.exec_stats.status, ExecStatus::Success);
    assert!(!third_trace.contains(&WireEvent::Init));
    assert_eq!(counting.load_count(), loads_after_bootstrap + 1, "third call still resumes the same instance");

    let fourth = Invocation::new("4", "fn-c", "{}", "");
    let (fourth_result, fourth_trace) = dispatcher.dispatch_traced(fourth).await;
    assert_eq!(fourth_result.info.exec_stats.status, ExecStatus::Success);
    assert!(!fourth_trace.contains(&WireEvent::Init));
    assert_eq!(
        counting.load_count(),
        loads_after_bootstrap + 2,
        "fourth call clones a fresh instance from the cached snapshot (warm, not hot)"
    );
}
