//! Snapshot Cache (C3): host-wide `FunctionId -> Snapshot` map, bounded,
//! single-writer-wins on first publish (I1).
//!
//! Grounded on `firecracker/vm_cache.rs`'s `VmResultCache` (RwLock-guarded
//! map plus stats), narrowed to the spec's "refuse when full, no eviction"
//! default (see DESIGN.md Open Question decisions).

use std::collections::HashMap;

use faas_common::FunctionId;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::instance_manager::Snapshot;

#[derive(Debug, Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
    rejected: u64,
}

pub struct SnapshotCache {
    entries: RwLock<HashMap<FunctionId, Snapshot>>,
    stats: RwLock<CacheStats>,
    cap: usize,
}

impl SnapshotCache {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            cap,
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, fid: &FunctionId) -> Option<Snapshot> {
        let entries = self.entries.read().await;
        let hit = entries.get(fid).cloned();
        let mut stats = self.stats.write().await;
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    /// Returns `true` iff `snap` was inserted. `false` means the caller must
    /// release `snap` themselves (I1: duplicate publish; I2: cache full).
    #[instrument(skip(self, snap))]
    pub async fn try_put(&self, fid: FunctionId, snap: Snapshot) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&fid) {
            debug!(%fid, "snapshot publish collision, discarding loser");
            self.stats.write().await.rejected += 1;
            return false;
        }
        if entries.len() >= self.cap {
            debug!(%fid, cap = self.cap, "snapshot cache full, refusing insert");
            self.stats.write().await.rejected += 1;
            return false;
        }
        entries.insert(fid, snap);
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_manager::Snapshot;

    fn snap(tag: &str) -> Snapshot {
        Snapshot::new_for_test(tag)
    }

    #[tokio::test]
    async fn try_put_rejects_second_publish_for_same_function() {
        let cache = SnapshotCache::new(8);
        let fid: FunctionId = "fn-a".into();
        assert!(cache.try_put(fid.clone(), snap("one")).await);
        assert!(!cache.try_put(fid.clone(), snap("two")).await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn try_put_refuses_once_cap_reached() {
        let cache = SnapshotCache::new(1);
        assert!(cache.try_put("fn-a".into(), snap("one")).await);
        assert!(!cache.try_put("fn-b".into(), snap("two")).await);
    }

    #[tokio::test]
    async fn get_returns_published_snapshot() {
        let cache = SnapshotCache::new(8);
        let fid: FunctionId = "fn-a".into();
        cache.try_put(fid.clone(), snap("one")).await;
        assert!(cache.get(&fid).await.is_some());
        assert!(cache.get(&"fn-missing".into()).await.is_none());
    }
}
