//! The Invoker Engine: a per-host subsystem that dispatches activations to
//! unikernel-backed instances through a three-tier cache (base snapshot,
//! per-function post-init snapshot, per-core hot pool), driving each
//! request's lifecycle over a dedicated TCP session.
//!
//! Module layout mirrors the component list: `instance_manager` (C1),
//! `session` (C2), `snapshot_cache` (C3), `hot_pool` (C4), `work_queue`
//! (C5), `dispatcher` (C6), `bootstrap` (C7).

pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hot_pool;
pub mod instance_manager;
pub mod ports;
pub mod session;
pub mod snapshot_cache;
pub mod transport;
pub mod wire;
pub mod work_queue;

pub use bootstrap::Engine;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use instance_manager::{Instance, InstanceId, InstanceManager, ProcessInstanceManager, Snapshot};
pub use transport::Transport;

pub use faas_common as common;
