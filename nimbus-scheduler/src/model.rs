use std::time::Instant;

use nimbus_transport::Transport;
use nimbus_vm::Vm;

/// An idle, post-init VM held in a warm pool, ready to serve the next
/// invocation without a connect/init round trip (§3 `WarmEntry`).
pub struct WarmEntry {
    pub vm: Vm,
    pub transport: Transport,
    pub code_hash: String,
    pub env_vars_hash: String,
    pub idle_since: Instant,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub status_code: u16,
    pub body: serde_json::Value,
    pub duration_ms: u64,
    pub billed_time_ms: u64,
    pub cold_start: bool,
    pub error: Option<String>,
}

/// One `(function, version)` row of `stats()` (§6.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintStats {
    pub warm: usize,
    pub busy: u32,
    pub total: usize,
    pub max: u32,
}
