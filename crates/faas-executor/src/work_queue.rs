//! Work Queue (C5): host-wide FIFO of pending `Invocation`s plus a side
//! lookup table, with best-effort wakeup of idle cores.
//!
//! Grounded on `faas-orchestrator/src/lib.rs`'s `Mutex<HashMap<_>>`
//! registry pattern, extended with the FIFO + poke-fanout the spec
//! requires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use faas_common::{Invocation, TransactionId};
use tokio::sync::{Mutex, Notify};
use tracing::instrument;

use crate::error::EngineError;

struct Inner {
    order: VecDeque<TransactionId>,
    table: HashMap<TransactionId, Invocation>,
}

/// Shared host-wide queue. Cheap to clone (`Arc` internally) so every core
/// dispatcher can hold its own handle plus its own wake channel.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    core_wakeups: Vec<Arc<Notify>>,
}

impl WorkQueue {
    pub fn new(core_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                table: HashMap::new(),
            }),
            core_wakeups: (0..core_count.max(1)).map(|_| Arc::new(Notify::new())).collect(),
        }
    }

    /// A clonable handle a core dispatcher can `notified()` on to learn new
    /// work may be available.
    pub fn wakeup_handle(&self, core_id: usize) -> Arc<Notify> {
        self.core_wakeups[core_id % self.core_wakeups.len()].clone()
    }

    /// Inserts `inv`, then pokes every core starting at a deterministic
    /// offset derived from its transaction id, so bursty ingress spreads
    /// wakeups rather than always targeting core 0.
    #[instrument(skip(self, inv), fields(transaction_id = %inv.info.transaction_id))]
    pub async fn add(&self, inv: Invocation) -> Result<(), EngineError> {
        let tid = inv.info.transaction_id.clone();
        {
            let mut inner = self.inner.lock().await;
            if inner.table.contains_key(&tid) {
                return Err(EngineError::DuplicateTransaction(tid.to_string()));
            }
            inner.table.insert(tid.clone(), inv);
            inner.order.push_back(tid.clone());
        }
        self.poke_all(&tid);
        Ok(())
    }

    pub async fn take(&self) -> Option<Invocation> {
        let mut inner = self.inner.lock().await;
        let tid = inner.order.pop_front()?;
        inner.table.remove(&tid)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    fn poke_all(&self, tid: &TransactionId) {
        if self.core_wakeups.is_empty() {
            return;
        }
        let offset = deterministic_offset(tid, self.core_wakeups.len());
        for i in 0..self.core_wakeups.len() {
            let idx = (offset + i) % self.core_wakeups.len();
            self.core_wakeups[idx].notify_one();
        }
    }
}

fn deterministic_offset(tid: &TransactionId, core_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    use std::hash::{Hash, Hasher};
    tid.hash(&mut hasher);
    (hasher.finish() as usize) % core_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(tid: &str) -> Invocation {
        Invocation::new(tid, "fn-a", "{}", "")
    }

    #[tokio::test]
    async fn add_then_take_is_fifo() {
        let queue = WorkQueue::new(1);
        queue.add(inv("t1")).await.unwrap();
        queue.add(inv("t2")).await.unwrap();
        assert_eq!(queue.take().await.unwrap().info.transaction_id, "t1".into());
        assert_eq!(queue.take().await.unwrap().info.transaction_id, "t2".into());
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn add_rejects_duplicate_transaction_id() {
        let queue = WorkQueue::new(1);
        queue.add(inv("t1")).await.unwrap();
        let err = queue.add(inv("t1")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTransaction(_)));
    }
}
