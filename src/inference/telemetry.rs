//! Memory footprint reporting.

use serde::Serialize;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Approximate memory held by the active session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryReport {
    /// Bytes reported by the model handle.
    pub model_bytes: u64,

    /// Bytes reported by the execution context's state.
    pub context_bytes: u64,
}

impl MemoryReport {
    pub fn total_bytes(&self) -> u64 {
        self.model_bytes.saturating_add(self.context_bytes)
    }

    /// Total footprint in megabytes (MiB).
    pub fn total_mb(&self) -> f64 {
        self.total_bytes() as f64 / BYTES_PER_MB
    }
}
