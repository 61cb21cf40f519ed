//! Per-core session source-port allocator with a host-wide liveness set
//! (I6: port uniqueness), per §4.5 and the Design Notes' "Port management"
//! entry: don't trust the step/bias arithmetic alone, re-draw on conflict.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Shared, host-wide. Each core's [`PortAllocator`] consults the same
/// registry so two cores can never hand out the same source port.
#[derive(Default)]
pub struct PortRegistry {
    live: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn try_reserve(&self, port: u16) -> bool {
        self.live.lock().await.insert(port)
    }

    pub async fn release(&self, port: u16) {
        self.live.lock().await.remove(&port);
    }
}

/// Owned by exactly one core's dispatcher (I4-adjacent: not a shared
/// instance resource, but still core-local by convention).
pub struct PortAllocator {
    core_id: u16,
    core_count: u16,
    base_port: u32,
    step: std::sync::atomic::AtomicU32,
    registry: Arc<PortRegistry>,
}

impl PortAllocator {
    pub fn new(core_id: u16, core_count: u16, base_port: u16, registry: Arc<PortRegistry>) -> Self {
        Self {
            core_id,
            core_count: core_count.max(1),
            base_port: base_port as u32,
            step: std::sync::atomic::AtomicU32::new(0),
            registry,
        }
    }

    /// Draws the next candidate port biased by `core_id`, confined to
    /// `[base_port, 65535]` with wrap-around, re-drawing on conflict with
    /// the host-wide live set.
    pub async fn allocate(&self) -> u16 {
        loop {
            let n = self.step.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let span = (65_535u32 - self.base_port).max(1);
            let raw = self.base_port
                + ((n.wrapping_mul(self.core_count as u32) + self.core_id as u32) % span);
            let port = raw as u16;
            if self.registry.try_reserve(port).await {
                return port;
            }
        }
    }

    pub async fn release(&self, port: u16) {
        self.registry.release(port).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocations_from_the_same_core_are_distinct() {
        let registry = PortRegistry::new();
        let alloc = PortAllocator::new(0, 2, 20_000, registry);
        let a = alloc.allocate().await;
        let b = alloc.allocate().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn two_cores_never_collide_on_the_shared_registry() {
        let registry = PortRegistry::new();
        let core0 = PortAllocator::new(0, 2, 20_000, registry.clone());
        let core1 = PortAllocator::new(1, 2, 20_000, registry);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            assert!(seen.insert(core0.allocate().await));
            assert!(seen.insert(core1.allocate().await));
        }
    }
}
