//! Default in-process implementations of §6.2's three collaborator traits.
//! A real deployment swaps these for a database-backed metadata store, a
//! registry service, and a metrics exporter; these make `nimbusd` runnable
//! standalone with nothing but a `tracing` subscriber behind it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_snapshot::{Function, MetadataStore, RootfsRegistry, Snapshot, SnapshotStatus, TelemetrySink};

#[derive(Default)]
struct FunctionStore {
    functions: HashMap<String, Function>,
    snapshots: HashMap<(String, u64, String), Snapshot>,
}

/// A `RwLock<HashMap<...>>` metadata store — fine for a single `nimbusd`
/// process, gone on restart.
pub struct InMemoryMetadataStore {
    inner: RwLock<FunctionStore>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FunctionStore::default()),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_function(&self, function_id: &str) -> Option<Function> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .functions
            .get(function_id)
            .cloned()
    }

    async fn upsert_function(&self, function: Function) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .functions
            .insert(function.id.clone(), function);
    }

    async fn get_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str) -> Option<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .snapshots
            .get(&(function_id.to_string(), version, env_vars_hash.to_string()))
            .cloned()
    }

    async fn upsert_snapshot(&self, snapshot: Snapshot) {
        self.inner.write().unwrap_or_else(|p| p.into_inner()).snapshots.insert(
            (
                snapshot.function_id.clone(),
                snapshot.version,
                snapshot.env_vars_hash.clone(),
            ),
            snapshot,
        );
    }

    async fn update_snapshot_status(
        &self,
        function_id: &str,
        version: u64,
        env_vars_hash: &str,
        status: SnapshotStatus,
        error_message: Option<String>,
    ) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(snap) = guard
            .snapshots
            .get_mut(&(function_id.to_string(), version, env_vars_hash.to_string()))
        {
            snap.status = status;
            snap.error_message = error_message;
        }
    }

    async fn expire_stale(&self, function_id: &str, current: &Function) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        for ((fid, _, _), snap) in guard.snapshots.iter_mut() {
            if fid == function_id
                && (snap.code_hash != current.code_hash || snap.env_vars_hash != current.env_vars_hash)
            {
                snap.expire();
            }
        }
    }

    async fn list_expired_before(&self, cutoff: DateTime<Utc>) -> Vec<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .snapshots
            .values()
            .filter(|s| s.status == SnapshotStatus::Expired && s.expires_at.is_some_and(|e| e <= cutoff))
            .cloned()
            .collect()
    }

    async fn remove_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .snapshots
            .remove(&(function_id.to_string(), version, env_vars_hash.to_string()));
    }

    async fn list_all_snapshots(&self) -> Vec<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .snapshots
            .values()
            .cloned()
            .collect()
    }
}

/// Resolves a runtime tag by checking for `{rootfs_dir}/base/{runtime}.ext4`
/// on disk — the same naming convention `nimbus_vm::VmPaths::base_rootfs`
/// uses internally, exposed here so other collaborators (and `nimbusd setup`)
/// can ask "is this runtime installed" without reaching into `nimbus-vm`.
pub struct DirectoryRootfsRegistry {
    rootfs_dir: PathBuf,
}

impl DirectoryRootfsRegistry {
    pub fn new(rootfs_dir: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_dir: rootfs_dir.into(),
        }
    }
}

#[async_trait]
impl RootfsRegistry for DirectoryRootfsRegistry {
    async fn base_path_for(&self, runtime: &str) -> Option<PathBuf> {
        let path: PathBuf = self.rootfs_dir.join("base").join(format!("{runtime}.ext4"));
        tokio::fs::try_exists(&path).await.ok().filter(|&e| e).map(|_| path)
    }
}

/// Emits every event as a `tracing::info!` with its tags and fields flattened
/// into the record — no metrics backend wired up, just structured logs.
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit_event(&self, name: &str, tags: &[(&str, &str)], fields: serde_json::Value) {
        tracing::info!(event = name, ?tags, %fields, "telemetry");
    }
}

pub fn rootfs_base_path(rootfs_dir: &Path, runtime: &str) -> PathBuf {
    rootfs_dir.join("base").join(format!("{runtime}.ext4"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn sample_function() -> Function {
        Function {
            id: "echo".into(),
            runtime: "python3.11".into(),
            handler: "handler.handler".into(),
            code_bytes: b"print('hi')".to_vec(),
            env_vars: StdHashMap::new(),
            memory_mib: 128,
            vcpus: 1,
            timeout_sec: 30,
            max_concurrency: 0,
            code_hash: "abc".into(),
            env_vars_hash: "def".into(),
            version: 1,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_function_round_trips() {
        let store = InMemoryMetadataStore::new();
        let f = sample_function();
        store.upsert_function(f.clone()).await;
        let got = store.get_function(&f.id).await.unwrap();
        assert_eq!(got.code_hash, f.code_hash);
    }

    #[tokio::test]
    async fn rootfs_registry_finds_existing_base_image() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("base")).await.unwrap();
        tokio::fs::write(dir.path().join("base").join("python3.11.ext4"), b"")
            .await
            .unwrap();

        let registry = DirectoryRootfsRegistry::new(dir.path());
        assert!(registry.base_path_for("python3.11").await.is_some());
        assert!(registry.base_path_for("node20").await.is_none());
    }
}
