//! Dispatcher throughput benchmarks: cold, warm, and hot dispatch latency
//! against the process-backed reference `InstanceManager`.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use faas_common::Invocation;
use faas_executor::config::EngineConfig;
use faas_executor::dispatcher::CoreDispatcher;
use faas_executor::instance_manager::ProcessInstanceManager;
use faas_executor::ports::PortRegistry;
use faas_executor::snapshot_cache::SnapshotCache;
use faas_executor::work_queue::WorkQueue;
use faas_executor::InstanceManager;
use tokio::runtime::Runtime;
use tokio::task::LocalSet;

const FUNCTION_CODE: &str = "function main(a){return a.x;}";

fn new_dispatcher(
    rt: &Runtime,
    base_port: u16,
    hot_cap: usize,
) -> (Rc<CoreDispatcher>, Arc<SnapshotCache>) {
    let config = Arc::new(EngineConfig {
        base_port,
        hot_cap,
        ..Default::default()
    });
    let instance_manager: Arc<dyn InstanceManager> =
        Arc::new(ProcessInstanceManager::new(base_port + 1000));
    let snapshot_cache = Arc::new(SnapshotCache::new(config.snap_cap));
    let work_queue = Arc::new(WorkQueue::new(1));
    let port_registry = PortRegistry::new();

    let base_snapshot = rt.block_on(async {
        let loaded = instance_manager
            .load(instance_manager.base_instance())
            .await
            .unwrap();
        instance_manager.start(loaded.id).await.unwrap();
        let snap = instance_manager.set_checkpoint(loaded.id).await.unwrap();
        instance_manager.halt(loaded.id).await.unwrap();
        Arc::new(snap)
    });

    let dispatcher = CoreDispatcher::new(
        0,
        config,
        instance_manager,
        snapshot_cache.clone(),
        work_queue,
        port_registry,
        base_snapshot,
    );
    (dispatcher, snapshot_cache)
}

fn bench_cold_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let local = LocalSet::new();

    c.bench_function("dispatch_cold", |b| {
        b.iter(|| {
            local.block_on(&rt, async {
                let (dispatcher, _cache) = new_dispatcher(&rt, 34_000, 4);
                let inv = Invocation::new("bench-cold", "fn-bench", r#"{"x":1}"#, FUNCTION_CODE);
                black_box(dispatcher.dispatch(inv).await)
            })
        });
    });
}

fn bench_warm_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let local = LocalSet::new();

    c.bench_function("dispatch_warm", |b| {
        b.iter(|| {
            local.block_on(&rt, async {
                // hot_cap: 0 so the first call's instance can never be stashed
                // into the hot pool; the second call is forced through the
                // warm (snapshot-cache clone) path instead of hot reuse.
                let (dispatcher, _cache) = new_dispatcher(&rt, 35_000, 0);
                let first = Invocation::new("bench-warm-1", "fn-bench", r#"{"x":1}"#, FUNCTION_CODE);
                black_box(dispatcher.clone().dispatch(first).await);
                let second = Invocation::new("bench-warm-2", "fn-bench", r#"{"x":2}"#, "");
                black_box(dispatcher.dispatch(second).await)
            })
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .measurement_time(Duration::from_secs(15));
    targets = bench_cold_dispatch, bench_warm_dispatch
);
criterion_main!(benches);
