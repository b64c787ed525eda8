//! Per-sandbox resource ceilings and the memory limiter that enforces them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use wasmtime::ResourceLimiter;

/// Wasm page size in bytes.
pub const WASM_PAGE_BYTES: usize = 64 * 1024;

/// Resource limits applied to every sandbox a factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceLimits {
    /// Linear memory ceiling in bytes. Ignored by the unsafe tier.
    pub max_memory_bytes: usize,
    /// Wall-clock budget for a single call (entry point, hook or `alloc`).
    pub call_timeout_ms: u64,
    /// Largest result a plugin may hand back.
    pub max_output_bytes: usize,
    /// Timeout for one `fetch` host call, further capped by the time left
    /// in the calling guest function.
    pub fetch_timeout_ms: u64,
    /// Largest response body `fetch` will buffer.
    pub max_fetch_bytes: usize,
    /// Quota of the per-sandbox key/value store.
    pub max_storage_bytes: usize,
    /// Fuel granted per millisecond of timeout on the unsafe tier.
    pub fuel_per_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 128 * 1024 * 1024, // 128MB
            call_timeout_ms: 5_000,
            max_output_bytes: 100 * 1024,
            fetch_timeout_ms: 10_000,
            max_fetch_bytes: 1024 * 1024,
            max_storage_bytes: 1024 * 1024,
            fuel_per_ms: 1_000_000,
        }
    }
}

impl ResourceLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Fuel approximating `call_timeout_ms` of execution.
    pub fn fuel_budget(&self) -> u64 {
        self.fuel_per_ms.saturating_mul(self.call_timeout_ms).max(1)
    }
}

/// Memory figures for one sandbox, for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_bytes: usize,
    pub peak_memory_bytes: usize,
    pub memory_limit_bytes: Option<usize>,
    pub denied_growths: u32,
}

/// A resource limiter that tracks linear memory growth.
///
/// With no ceiling it only records usage.
#[derive(Debug, Clone)]
pub(crate) struct MemoryLimiter {
    max_memory: Option<usize>,
    current: usize,
    peak: usize,
    denied: u32,
    max_tables: usize,
    max_table_elements: usize,
    max_instances: usize,
    max_memories: usize,
}

impl MemoryLimiter {
    pub fn new(max_memory: Option<usize>) -> Self {
        Self {
            max_memory,
            current: 0,
            peak: 0,
            denied: 0,
            max_tables: 100,
            max_table_elements: 20_000,
            max_instances: 50,
            max_memories: 50,
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.current,
            peak_memory_bytes: self.peak,
            memory_limit_bytes: self.max_memory,
            denied_growths: self.denied,
        }
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        match self.max_memory {
            Some(max) if desired > max => {
                self.denied += 1;
                debug!(current, desired, max, "Memory growth denied - would exceed limit");
                Ok(false)
            }
            _ => {
                self.current = desired;
                self.peak = self.peak.max(desired);
                Ok(true)
            }
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }

    fn instances(&self) -> usize {
        self.max_instances
    }

    fn tables(&self) -> usize {
        self.max_tables
    }

    fn memories(&self) -> usize {
        self.max_memories
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.call_timeout(), Duration::from_secs(5));
        assert_eq!(limits.max_output_bytes, 102_400);
        assert_eq!(limits.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(limits.max_fetch_bytes, 1024 * 1024);
    }

    #[test]
    fn fuel_budget_scales_with_timeout() {
        let limits = ResourceLimits {
            call_timeout_ms: 10,
            fuel_per_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(limits.fuel_budget(), 10_000);

        let saturated = ResourceLimits {
            call_timeout_ms: u64::MAX,
            fuel_per_ms: 2,
            ..Default::default()
        };
        assert_eq!(saturated.fuel_budget(), u64::MAX);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let limits: ResourceLimits = toml::from_str("call-timeout-ms = 250").unwrap();
        assert_eq!(limits.call_timeout_ms, 250);
        assert_eq!(limits.max_output_bytes, ResourceLimits::default().max_output_bytes);
    }

    #[test]
    fn limiter_denies_growth_past_ceiling() {
        let mut limiter = MemoryLimiter::new(Some(2 * WASM_PAGE_BYTES));
        assert!(limiter.memory_growing(0, WASM_PAGE_BYTES, None).unwrap());
        assert!(limiter.memory_growing(WASM_PAGE_BYTES, 2 * WASM_PAGE_BYTES, None).unwrap());
        assert!(!limiter.memory_growing(2 * WASM_PAGE_BYTES, 3 * WASM_PAGE_BYTES, None).unwrap());

        let usage = limiter.usage();
        assert_eq!(usage.memory_bytes, 2 * WASM_PAGE_BYTES);
        assert_eq!(usage.peak_memory_bytes, 2 * WASM_PAGE_BYTES);
        assert_eq!(usage.denied_growths, 1);
    }

    #[test]
    fn unbounded_limiter_only_tracks() {
        let mut limiter = MemoryLimiter::new(None);
        assert!(limiter.memory_growing(0, 1 << 30, None).unwrap());
        assert_eq!(limiter.usage().memory_limit_bytes, None);
        assert_eq!(limiter.usage().peak_memory_bytes, 1 << 30);
    }
}
