//! Hot-Instance Pool (C4): per-core FIFO of idle-but-booted instances.
//!
//! Grounded on `container_pool.rs`'s tiered `VecDeque` pools, narrowed to
//! the spec's per-core, lock-free shape (I4: owning core only).

use std::collections::{HashMap, VecDeque};

use faas_common::FunctionId;

use crate::instance_manager::InstanceId;

/// Not `Send`-shared: one `HotPool` lives inside a single core's dispatcher
/// and is only ever touched by that core's task (see `dispatcher.rs`).
pub struct HotPool {
    cap: usize,
    reuse_cap: u32,
    by_fid: HashMap<FunctionId, InstanceId>,
    order: VecDeque<FunctionId>,
    uses: HashMap<InstanceId, u32>,
}

impl HotPool {
    pub fn new(cap: usize, reuse_cap: u32) -> Self {
        Self {
            cap,
            reuse_cap,
            by_fid: HashMap::new(),
            order: VecDeque::new(),
            uses: HashMap::new(),
        }
    }

    pub fn has(&self, fid: &FunctionId) -> bool {
        self.by_fid.contains_key(fid)
    }

    /// Removes and returns the idle instance for `fid`. Panics if absent,
    /// matching the spec's contract (callers must check `has` first).
    pub fn take(&mut self, fid: &FunctionId) -> InstanceId {
        let iid = self
            .by_fid
            .remove(fid)
            .expect("hot_pool.take called for a function with no idle instance");
        self.order.retain(|f| f != fid);
        iid
    }

    /// Returns the number of successful sessions `iid` has already served.
    pub fn uses_of(&self, iid: &InstanceId) -> u32 {
        self.uses.get(iid).copied().unwrap_or(0)
    }

    /// Attempts to stash `iid`, which has just completed one more
    /// successful session, under `fid`. Returns `true` iff ownership
    /// transferred; the instance's serve count is tracked internally.
    pub fn try_stash(&mut self, fid: FunctionId, iid: InstanceId) -> bool {
        let next_uses = self.uses_of(&iid) + 1;
        if self.by_fid.contains_key(&fid) {
            return false;
        }
        if next_uses > self.reuse_cap {
            return false;
        }
        if self.by_fid.len() >= self.cap {
            return false;
        }
        self.uses.insert(iid, next_uses);
        self.order.push_back(fid.clone());
        self.by_fid.insert(fid, iid);
        true
    }

    pub fn len(&self) -> usize {
        self.by_fid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fid.is_empty()
    }
}
