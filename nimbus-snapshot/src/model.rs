//! Data shapes shared with collaborators — the `function_spec` from §6.1 and
//! the `Snapshot` metadata row from §3.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a caller (gateway, workflow engine) hands the core to run a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub runtime: String,
    pub handler: String,
    pub code_bytes: Vec<u8>,
    pub env_vars: HashMap<String, String>,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub timeout_sec: u64,
    pub max_concurrency: u32,
    pub code_hash: String,
    pub env_vars_hash: String,
    pub version: u64,
}

/// The fingerprint that decides whether two `Function` deployments can share
/// a warm pool / snapshot (§4.E's `warm_pool` key, §3's Snapshot invariant a).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint<'a> {
    pub code_hash: &'a str,
    pub env_vars_hash: &'a str,
}

impl Function {
    pub fn fingerprint(&self) -> Fingerprint<'_> {
        Fingerprint {
            code_hash: &self.code_hash,
            env_vars_hash: &self.env_vars_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Building,
    Ready,
    Failed,
    Expired,
}

/// One row of Snapshot metadata (§3). `mem_path`/`state_path` and their sizes
/// are only meaningful while `status` is `Building` or `Ready` (invariant c).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub function_id: String,
    pub version: u64,
    pub code_hash: String,
    pub runtime: String,
    pub memory_mib: u32,
    pub env_vars_hash: String,
    pub mem_path: String,
    pub state_path: String,
    pub mem_bytes: u64,
    pub state_bytes: u64,
    pub status: SnapshotStatus,
    pub error_message: Option<String>,
    pub restore_count: u64,
    pub avg_restore_ms: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn building(function: &Function, out_dir: &std::path::Path) -> Self {
        let now = Utc::now();
        Self {
            snapshot_id: Uuid::new_v4(),
            function_id: function.id.clone(),
            version: function.version,
            code_hash: function.code_hash.clone(),
            runtime: function.runtime.clone(),
            memory_mib: function.memory_mib,
            env_vars_hash: function.env_vars_hash.clone(),
            mem_path: out_dir.join("mem").display().to_string(),
            state_path: out_dir.join("state").display().to_string(),
            mem_bytes: 0,
            state_bytes: 0,
            status: SnapshotStatus::Building,
            error_message: None,
            restore_count: 0,
            avg_restore_ms: 0.0,
            created_at: now,
            last_used_at: now,
            expires_at: None,
        }
    }

    /// Record a restore: bump `restore_count`, fold `latency_ms` into the
    /// rolling average (§4.E step 2's "update snapshot's restore_count and
    /// rolling avg_restore_ms").
    pub fn record_restore(&mut self, latency_ms: f64) {
        let n = self.restore_count as f64;
        self.avg_restore_ms = (self.avg_restore_ms * n + latency_ms) / (n + 1.0);
        self.restore_count += 1;
        self.last_used_at = Utc::now();
    }

    /// Transition to `Expired`, stamping `expires_at` as the moment the grace
    /// period for file deletion starts (§4.D invalidation rule).
    pub fn expire(&mut self) {
        self.status = SnapshotStatus::Expired;
        self.expires_at = Some(Utc::now());
    }
}
