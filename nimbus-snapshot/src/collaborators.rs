//! The three external-collaborator traits from §6.2: Metadata store, Rootfs
//! registry, Telemetry sink. `nimbus-core` owns the default in-process
//! implementations (in-memory metadata map, directory-scan rootfs registry, a
//! `tracing`-backed telemetry sink) — grounded on the teacher's pattern of a
//! narrow collaborator boundary (`runner::api`) the runner can swap out
//! without touching the sandbox/factory logic underneath.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Function, Snapshot, SnapshotStatus};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_function(&self, function_id: &str) -> Option<Function>;
    async fn upsert_function(&self, function: Function);

    /// Snapshot rows are keyed on the full fingerprint `(function_id, version,
    /// env_vars_hash)` — §3 invariant (a) allows more than one `Ready`
    /// snapshot per `(function_id, version)` as long as `env_vars_hash`
    /// differs.
    async fn get_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str) -> Option<Snapshot>;
    async fn upsert_snapshot(&self, snapshot: Snapshot);

    /// Transactional status update (§5 ordering guarantee d: files exist on
    /// disk before `Building` -> `Ready`).
    async fn update_snapshot_status(
        &self,
        function_id: &str,
        version: u64,
        env_vars_hash: &str,
        status: SnapshotStatus,
        error_message: Option<String>,
    );

    /// Mark every `Ready`/`Building` snapshot for `function_id` whose
    /// `code_hash`/`env_vars_hash` no longer matches `current` as `Expired`
    /// (§4.D invalidation rule, §3 invariant b).
    async fn expire_stale(&self, function_id: &str, current: &Function);

    /// Every `Expired` snapshot whose `expires_at` is at or before `cutoff`
    /// (§4.E's "delete on-disk snapshots in Expired after a grace period").
    async fn list_expired_before(&self, cutoff: DateTime<Utc>) -> Vec<Snapshot>;

    /// Drop a snapshot's metadata row entirely, once its files are deleted.
    async fn remove_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str);

    /// Every known snapshot row, for `stats()`'s snapshot aggregate (§6.1).
    async fn list_all_snapshots(&self) -> Vec<Snapshot>;
}

/// Resolves a runtime tag to the path of its base, read-only rootfs image.
#[async_trait]
pub trait RootfsRegistry: Send + Sync {
    async fn base_path_for(&self, runtime: &str) -> Option<PathBuf>;
}

/// Emits named events with string tags and arbitrary structured fields; the
/// core does not own the observability format (§6.2).
pub trait TelemetrySink: Send + Sync {
    fn emit_event(&self, name: &str, tags: &[(&str, &str)], fields: serde_json::Value);
}
