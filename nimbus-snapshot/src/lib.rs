//! Snapshot Engine (component D): turns a `Function` version into a
//! restorable memory image + VM state file pair, and keeps their metadata in
//! sync with the external store.

mod collaborators;
mod engine;
mod error;
mod model;

pub use collaborators::{MetadataStore, RootfsRegistry, TelemetrySink};
pub use engine::SnapshotEngine;
pub use error::{Result, SnapshotError};
pub use model::{Fingerprint, Function, Snapshot, SnapshotStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    struct InMemoryStore {
        snapshots: Mutex<HashMap<(String, u64, String), Snapshot>>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                snapshots: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl MetadataStore for InMemoryStore {
        async fn get_function(&self, _function_id: &str) -> Option<Function> {
            None
        }
        async fn upsert_function(&self, _function: Function) {}

        async fn get_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str) -> Option<Snapshot> {
            self.snapshots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(&(function_id.to_string(), version, env_vars_hash.to_string()))
                .cloned()
        }

        async fn upsert_snapshot(&self, snapshot: Snapshot) {
            self.snapshots.lock().unwrap_or_else(|p| p.into_inner()).insert(
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
            if let Some(s) = self
                .snapshots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get_mut(&(function_id.to_string(), version, env_vars_hash.to_string()))
            {
                s.status = status;
                s.error_message = error_message;
            }
        }

        async fn expire_stale(&self, function_id: &str, current: &Function) {
            let mut guard = self.snapshots.lock().unwrap_or_else(|p| p.into_inner());
            for ((fid, _, _), snap) in guard.iter_mut() {
                if fid == function_id
                    && (snap.code_hash != current.code_hash
                        || snap.env_vars_hash != current.env_vars_hash)
                {
                    snap.expire();
                }
            }
        }

        async fn list_expired_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Vec<Snapshot> {
            self.snapshots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .values()
                .filter(|s| {
                    s.status == SnapshotStatus::Expired && s.expires_at.is_some_and(|e| e <= cutoff)
                })
                .cloned()
                .collect()
        }

        async fn remove_snapshot(&self, function_id: &str, version: u64, env_vars_hash: &str) {
            self.snapshots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&(function_id.to_string(), version, env_vars_hash.to_string()));
        }

        async fn list_all_snapshots(&self) -> Vec<Snapshot> {
            self.snapshots
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .values()
                .cloned()
                .collect()
        }
    }

    fn sample_function() -> Function {
        Function {
            id: "echo".into(),
            runtime: "python3.11".into(),
            handler: "handler.handler".into(),
            code_bytes: b"print('hi')".to_vec(),
            env_vars: HashMap::new(),
            memory_mib: 128,
            vcpus: 1,
            timeout_sec: 30,
            max_concurrency: 0,
            code_hash: "abc123".into(),
            env_vars_hash: "def456".into(),
            version: 1,
        }
    }

    #[test]
    fn fingerprint_reflects_function_hashes() {
        let f = sample_function();
        let fp = f.fingerprint();
        assert_eq!(fp.code_hash, "abc123");
        assert_eq!(fp.env_vars_hash, "def456");
    }

    #[test]
    fn record_restore_updates_rolling_average() {
        let f = sample_function();
        let mut snap = Snapshot::building(&f, std::path::Path::new("/tmp/out"));
        snap.record_restore(100.0);
        assert_eq!(snap.restore_count, 1);
        assert!((snap.avg_restore_ms - 100.0).abs() < f64::EPSILON);
        snap.record_restore(200.0);
        assert_eq!(snap.restore_count, 2);
        assert!((snap.avg_restore_ms - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expire_stale_marks_mismatched_snapshot_expired() {
        let store = InMemoryStore::new();
        let f = sample_function();
        let snap = Snapshot::building(&f, std::path::Path::new("/tmp/out"));
        store.upsert_snapshot(snap).await;

        let mut newer = f.clone();
        newer.code_hash = "different".into();
        store.expire_stale(&f.id, &newer).await;

        let updated = store.get_snapshot(&f.id, f.version, &f.env_vars_hash).await.unwrap();
        assert_eq!(updated.status, SnapshotStatus::Expired);
    }

    fn dummy_vm_manager() -> Arc<nimbus_vm::VmManager> {
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        Arc::new(nimbus_vm::VmManager::new(
            nimbus_vm::VmManagerConfig {
                binary_path: "/usr/bin/firecracker".into(),
                kernel_path: "/var/lib/nimbus/vmlinux".into(),
                rootfs_dir: "/var/lib/nimbus/rootfs".into(),
                socket_dir: "/run/nimbus/sock".into(),
                vsock_dir: "/run/nimbus/vsock".into(),
                log_dir: "/var/log/nimbus".into(),
            },
            network,
        ))
    }

    #[tokio::test]
    async fn destroy_removes_files_and_row_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let f = sample_function();
        let snap = Snapshot::building(&f, dir.path());
        tokio::fs::write(&snap.mem_path, b"mem").await.unwrap();
        tokio::fs::write(&snap.state_path, b"state").await.unwrap();
        store.upsert_snapshot(snap).await;

        let engine = SnapshotEngine::new(dummy_vm_manager(), store.clone());
        engine.destroy(&f.id, f.version).await.unwrap();

        assert!(store.get_snapshot(&f.id, f.version, &f.env_vars_hash).await.is_none());
    }

    #[tokio::test]
    async fn destroy_of_unknown_snapshot_is_a_noop() {
        let store = Arc::new(InMemoryStore::new());
        let engine = SnapshotEngine::new(dummy_vm_manager(), store.clone());
        engine.destroy("nonexistent", 1).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_expired_deletes_files_past_grace_and_drops_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let f = sample_function();
        let mut snap = Snapshot::building(&f, dir.path());
        tokio::fs::write(&snap.mem_path, b"mem").await.unwrap();
        tokio::fs::write(&snap.state_path, b"state").await.unwrap();
        snap.expire();
        store.upsert_snapshot(snap).await;

        let engine = SnapshotEngine::new(dummy_vm_manager(), store.clone());
        let swept = engine.sweep_expired(Duration::from_secs(0)).await;

        assert_eq!(swept, 1);
        assert!(store.get_snapshot(&f.id, f.version, &f.env_vars_hash).await.is_none());
    }

    #[tokio::test]
    async fn sweep_expired_leaves_snapshots_still_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let f = sample_function();
        let mut snap = Snapshot::building(&f, dir.path());
        tokio::fs::write(&snap.mem_path, b"mem").await.unwrap();
        tokio::fs::write(&snap.state_path, b"state").await.unwrap();
        snap.expire();
        store.upsert_snapshot(snap).await;

        let engine = SnapshotEngine::new(dummy_vm_manager(), store.clone());
        let swept = engine.sweep_expired(Duration::from_secs(3600)).await;

        assert_eq!(swept, 0);
        assert!(store.get_snapshot(&f.id, f.version, &f.env_vars_hash).await.is_some());
    }
}
