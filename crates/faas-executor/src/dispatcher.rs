//! Invoker Core Dispatcher (C6): the heart of the engine. Picks hot / warm
//! / cold per request, orchestrates C2-C4, enforces per-core concurrency,
//! and emits `InvocationResult` on completion.
//!
//! Grounded on `executor.rs`'s strategy-dispatch shape and
//! `#[instrument]` usage, narrowed from the teacher's Container/MicroVM/
//! Hybrid strategy selection to the spec's hot/warm/cold decision.
//!
//! `HotPool` is strictly per-core (I4), so `CoreDispatcher` lives behind an
//! `Rc` and runs inside a single-threaded `LocalSet` (see `bootstrap.rs`)
//! rather than `Arc`/`Send` task spawning — this gives lock-free hot-pool
//! access at the cost of no cross-core sharing, matching §5's concurrency
//! table exactly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use faas_common::{ExecStats, Invocation, InvocationInfo, InvocationResult};
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::hot_pool::HotPool;
use crate::instance_manager::{InstanceId, InstanceManager, Snapshot};
use crate::ports::{PortAllocator, PortRegistry};
use crate::session::{InvocationSession, ResponseKind, WireEvent};
use crate::snapshot_cache::SnapshotCache;
use crate::work_queue::WorkQueue;

pub struct CoreDispatcher {
    core_id: u16,
    config: Arc<EngineConfig>,
    instance_manager: Arc<dyn InstanceManager>,
    snapshot_cache: Arc<SnapshotCache>,
    work_queue: Arc<WorkQueue>,
    wake: Arc<Notify>,
    ports: PortAllocator,
    hot_pool: RefCell<HotPool>,
    instance_addrs: RefCell<HashMap<InstanceId, SocketAddr>>,
    in_flight: AtomicU8,
    /// Produced once by Bootstrap (C7); every cold start clones from this
    /// rather than re-booting the embedded base image.
    base_snapshot: Arc<Snapshot>,
}

impl CoreDispatcher {
    pub fn new(
        core_id: u16,
        config: Arc<EngineConfig>,
        instance_manager: Arc<dyn InstanceManager>,
        snapshot_cache: Arc<SnapshotCache>,
        work_queue: Arc<WorkQueue>,
        port_registry: Arc<PortRegistry>,
        base_snapshot: Arc<Snapshot>,
    ) -> Rc<Self> {
        let wake = work_queue.wakeup_handle(core_id as usize);
        Rc::new(Self {
            ports: PortAllocator::new(core_id, config.core_count, config.base_port, port_registry),
            core_id,
            hot_pool: RefCell::new(HotPool::new(config.hot_cap, config.reuse_cap)),
            in_flight: AtomicU8::new(0),
            instance_addrs: RefCell::new(HashMap::new()),
            base_snapshot,
            config,
            instance_manager,
            snapshot_cache,
            work_queue,
            wake,
        })
    }

    /// §4.5.4 scheduling loop. Runs until the process shuts down; intended
    /// to be spawned with `tokio::task::spawn_local` inside a `LocalSet`.
    /// Every completed invocation is handed to `transport.deliver_result`.
    pub async fn run(self: Rc<Self>, transport: Arc<dyn crate::transport::Transport>) {
        loop {
            while (self.in_flight.load(Ordering::Relaxed) as u8) < self.config.concur_cap {
                match self.work_queue.take().await {
                    Some(inv) => {
                        self.in_flight.fetch_add(1, Ordering::Relaxed);
                        let this = self.clone();
                        let transport = transport.clone();
                        tokio::task::spawn_local(async move {
                            let result = this.clone().dispatch(inv).await;
                            this.in_flight.fetch_sub(1, Ordering::Relaxed);
                            transport.deliver_result(result).await;
                        });
                    }
                    None => break,
                }
            }
            // Lost-wakeup backstop: `Notify` buffers at most one permit, and
            // a core that races a `poke` against its own drain loop could
            // otherwise sleep past available work. A short poll bounds that.
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(25)) => {}
            }
        }
    }

    /// Dispatches one invocation to completion and emits its result.
    /// Exposed publicly (rather than only via `run`'s internal loop) so a
    /// `Transport`-driven host and direct tests can both drive it.
    #[instrument(skip(self, inv), fields(core_id = self.core_id, transaction_id = %inv.info.transaction_id, function_id = %inv.info.function_id))]
    pub async fn dispatch(self: Rc<Self>, inv: Invocation) -> InvocationResult {
        self.dispatch_traced(inv).await.0
    }

    /// Same as [`dispatch`](Self::dispatch) but also returns the session's
    /// wire trace, used by integration tests to assert hot/warm paths never
    /// re-send `/init` (spec §8 round-trip properties).
    pub async fn dispatch_traced(self: Rc<Self>, inv: Invocation) -> (InvocationResult, Vec<WireEvent>) {
        let fid = inv.info.function_id.clone();

        let hot_instance = {
            let mut pool = self.hot_pool.borrow_mut();
            if pool.has(&fid) {
                Some(pool.take(&fid))
            } else {
                None
            }
        };

        if let Some(iid) = hot_instance {
            return self.run_hot(iid, fid, inv).await;
        }

        if let Some(snap) = self.snapshot_cache.get(&fid).await {
            return self.run_warm(snap, fid, inv).await;
        }

        self.run_cold(fid, inv).await
    }

    async fn run_hot(
        &self,
        iid: InstanceId,
        fid: faas_common::FunctionId,
        inv: Invocation,
    ) -> (InvocationResult, Vec<WireEvent>) {
        let addr = match self.instance_addrs.borrow().get(&iid).copied() {
            Some(addr) => addr,
            None => {
                warn!(?iid, "hot instance missing known address, treating as failure");
                return (self.failure_result(inv.info), Vec::new());
            }
        };
        if let Err(e) = self.instance_manager.resume(iid).await {
            warn!(?iid, error = %e, "resume failed on hot path");
            self.instance_addrs.borrow_mut().remove(&iid);
            return (self.failure_result(inv.info), Vec::new());
        }

        let (session, success) = self
            .run_exchange(addr, &inv.info.transaction_id.to_string(), None, &inv.args)
            .await;

        if success {
            let stashed = self.hot_pool.borrow_mut().try_stash(fid, iid);
            if !stashed {
                self.halt(iid).await;
            }
        } else {
            self.halt(iid).await;
        }

        let trace = session.trace().to_vec();
        (self.package_result(inv.info, session, success), trace)
    }

    async fn run_warm(
        &self,
        snap: Snapshot,
        fid: faas_common::FunctionId,
        inv: Invocation,
    ) -> (InvocationResult, Vec<WireEvent>) {
        let instance = self.instance_manager.clone_from(&snap);
        let loaded = match self.instance_manager.load(instance).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "load failed on warm path");
                return (self.failure_result(inv.info), Vec::new());
            }
        };
        self.instance_addrs.borrow_mut().insert(loaded.id, loaded.addr);
        if let Err(e) = self.instance_manager.start(loaded.id).await {
            warn!(error = %e, "start failed on warm path");
            self.halt(loaded.id).await;
            return (self.failure_result(inv.info), Vec::new());
        }

        let (session, success) = self
            .run_exchange(
                loaded.addr,
                &inv.info.transaction_id.to_string(),
                None,
                &inv.args,
            )
            .await;

        if success {
            let stashed = self.hot_pool.borrow_mut().try_stash(fid, loaded.id);
            if !stashed {
                self.halt(loaded.id).await;
            }
        } else {
            self.halt(loaded.id).await;
        }

        let trace = session.trace().to_vec();
        (self.package_result(inv.info, session, success), trace)
    }

    async fn run_cold(
        &self,
        fid: faas_common::FunctionId,
        inv: Invocation,
    ) -> (InvocationResult, Vec<WireEvent>) {
        let instance = self.instance_manager.clone_from(&self.base_snapshot);
        let loaded = match self.instance_manager.load(instance).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "load failed on cold path");
                return (self.failure_result(inv.info), Vec::new());
            }
        };
        self.instance_addrs.borrow_mut().insert(loaded.id, loaded.addr);
        if let Err(e) = self.instance_manager.start(loaded.id).await {
            warn!(error = %e, "start failed on cold path");
            self.halt(loaded.id).await;
            return (self.failure_result(inv.info), Vec::new());
        }

        let checkpoint_fut = self.instance_manager.set_checkpoint(loaded.id);
        let exchange_fut = self.run_exchange(
            loaded.addr,
            &inv.info.transaction_id.to_string(),
            Some(&inv.code),
            &inv.args,
        );
        let (checkpoint_res, (session, success)) = tokio::join!(checkpoint_fut, exchange_fut);

        if success {
            if let Ok(snap) = checkpoint_res {
                // `try_put` returning false (I1 collision or I2 full) just
                // means this invocation's snapshot is discarded; it does
                // not fail the invocation (§4.5 Failure policy).
                self.snapshot_cache.try_put(fid.clone(), snap).await;
            }
            let stashed = self.hot_pool.borrow_mut().try_stash(fid, loaded.id);
            if !stashed {
                self.halt(loaded.id).await;
            }
        } else {
            self.halt(loaded.id).await;
        }

        let trace = session.trace().to_vec();
        (self.package_result(inv.info, session, success), trace)
    }

    /// Allocates a source port, drives the full session, then releases the
    /// port. Shared by all three paths; `code_for_init = None` skips `/init`
    /// entirely (warm and hot never re-initialize, per the Open Question
    /// decision in DESIGN.md).
    async fn run_exchange(
        &self,
        addr: SocketAddr,
        transaction_id: &str,
        code_for_init: Option<&str>,
        args: &str,
    ) -> (InvocationSession, bool) {
        let port = self.ports.allocate().await;
        let mut session = InvocationSession::new(
            transaction_id,
            addr,
            port,
            self.config.connect_timeout,
            self.config.invocation_timeout,
        );

        let outcome: Result<(), crate::error::EngineError> = async {
            session.connect().await?;
            if let Some(code) = code_for_init {
                session.send("/init", code, true).await?;
                session.await_response().await.and_then(|kind| match kind {
                    ResponseKind::Initialized => Ok(()),
                    ResponseKind::Executed => Err(crate::error::EngineError::Protocol {
                        transaction_id: transaction_id.to_string(),
                        detail: "expected initialized response".to_string(),
                    }),
                })?;
            }
            session.send("/run", args, false).await?;
            session.await_response().await.map(|_| ())
        }
        .await;

        session.close().await;
        let success = outcome.is_ok();
        session.finish(success);
        self.ports.release(port).await;
        (session, success)
    }

    async fn halt(&self, iid: InstanceId) {
        if let Err(e) = self.instance_manager.halt(iid).await {
            warn!(?iid, error = %e, "halt failed");
        }
        self.instance_addrs.borrow_mut().remove(&iid);
    }

    fn package_result(&self, info: InvocationInfo, session: InvocationSession, success: bool) -> InvocationResult {
        let (init_ms, run_ms) = session.timings();
        self.finish_info(info, session.reply().to_string(), success, init_ms, run_ms)
    }

    fn failure_result(&self, info: InvocationInfo) -> InvocationResult {
        self.finish_info(info, String::new(), false, 0, 0)
    }

    fn finish_info(
        &self,
        mut info: InvocationInfo,
        reply: String,
        success: bool,
        init_ms: u64,
        run_ms: u64,
    ) -> InvocationResult {
        info.exec_stats = if success {
            ExecStats::success(init_ms, run_ms)
        } else {
            ExecStats::failure(init_ms, run_ms)
        };
        info!(
            transaction_id = %info.transaction_id,
            function_id = %info.function_id,
            status = ?info.exec_stats.status,
            "invocation finished"
        );
        InvocationResult { info, reply }
    }
}
