//! Environment-driven engine configuration (§10 Configuration).
//!
//! Mirrors the teacher's `VmConfig`/`CacheConfig` shape: a plain struct with a
//! `Default` impl and a `from_env` constructor, read once at process start.

use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tunables for one core's dispatcher plus the host-wide caches.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max in-flight invocations per core (`CONCUR_CAP`).
    pub concur_cap: u8,
    /// Max idle instances per core in the hot pool (`HOT_CAP`).
    pub hot_cap: usize,
    /// Max successful sessions a single instance may serve (`REUSE_CAP`).
    pub reuse_cap: u32,
    /// Max snapshots retained host-wide (`SNAP_CAP`).
    pub snap_cap: usize,
    /// Deadline for the TCP handshake phase of a session.
    pub connect_timeout: Duration,
    /// Deadline for the remainder of a session once connected.
    pub invocation_timeout: Duration,
    /// Lower bound of the per-core source port range.
    pub base_port: u16,
    /// Loopback address the in-VM HTTP runtime listens on.
    pub vm_host: Ipv4Addr,
    /// Port the in-VM HTTP runtime listens on.
    pub vm_port: u16,
    /// Number of cores (dispatchers) to run.
    pub core_count: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concur_cap: 8,
            hot_cap: 4,
            reuse_cap: 16,
            snap_cap: 64,
            connect_timeout: Duration::from_millis(5_000),
            invocation_timeout: Duration::from_millis(60_000),
            base_port: 20_000,
            vm_host: Ipv4Addr::new(127, 0, 0, 1),
            vm_port: 8080,
            core_count: 1,
        }
    }
}

impl EngineConfig {
    /// Reads every field from the environment, falling back to the documented
    /// default when a variable is unset or fails to parse. Intended to be
    /// called once at process start, after `dotenvy::dotenv()`.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            concur_cap: env_or("CONCUR_CAP", default.concur_cap),
            hot_cap: env_or("HOT_CAP", default.hot_cap),
            reuse_cap: env_or("REUSE_CAP", default.reuse_cap),
            snap_cap: env_or("SNAP_CAP", default.snap_cap),
            connect_timeout: Duration::from_millis(env_or(
                "CONNECT_TIMEOUT_MS",
                default.connect_timeout.as_millis() as u64,
            )),
            invocation_timeout: Duration::from_millis(env_or(
                "INVOCATION_TIMEOUT_MS",
                default.invocation_timeout.as_millis() as u64,
            )),
            base_port: env_or("BASE_PORT", default.base_port),
            vm_host: env_or("VM_HOST", default.vm_host),
            vm_port: env_or("VM_PORT", default.vm_port),
            core_count: env_or("CORE_COUNT", default.core_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_non_zero() {
        let cfg = EngineConfig::default();
        assert!(cfg.concur_cap > 0);
        assert!(cfg.snap_cap > 0);
    }
}
