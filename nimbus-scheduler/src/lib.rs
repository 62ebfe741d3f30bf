//! Execution Scheduler (component E): warm pools, admission control, and the
//! acquire/execute/release protocol that keeps steady-state cold starts rare.

mod error;
mod model;
mod pool;
mod scheduler;

pub use error::{Result, SchedulerError};
pub use model::{ExecuteOutcome, FingerprintStats, WarmEntry};
pub use scheduler::{Scheduler, SchedulerConfig};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use nimbus_snapshot::{Function, MetadataStore, Snapshot, SnapshotStatus, TelemetrySink};
    use std::collections::HashMap;

    use super::*;

    struct NullMetadataStore;

    #[async_trait::async_trait]
    impl MetadataStore for NullMetadataStore {
        async fn get_function(&self, _function_id: &str) -> Option<Function> {
            None
        }
        async fn upsert_function(&self, _function: Function) {}
        async fn get_snapshot(&self, _function_id: &str, _version: u64, _env_vars_hash: &str) -> Option<Snapshot> {
            None
        }
        async fn upsert_snapshot(&self, _snapshot: Snapshot) {}
        async fn update_snapshot_status(
            &self,
            _function_id: &str,
            _version: u64,
            _env_vars_hash: &str,
            _status: SnapshotStatus,
            _error_message: Option<String>,
        ) {
        }
        async fn expire_stale(&self, _function_id: &str, _current: &Function) {}
        async fn list_expired_before(&self, _cutoff: chrono::DateTime<chrono::Utc>) -> Vec<Snapshot> {
            Vec::new()
        }
        async fn remove_snapshot(&self, _function_id: &str, _version: u64, _env_vars_hash: &str) {}
        async fn list_all_snapshots(&self) -> Vec<Snapshot> {
            Vec::new()
        }
    }

    struct NullTelemetry;

    impl TelemetrySink for NullTelemetry {
        fn emit_event(&self, _name: &str, _tags: &[(&str, &str)], _fields: serde_json::Value) {}
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
            max_concurrency: 1,
            code_hash: "abc".into(),
            env_vars_hash: "def".into(),
            version: 1,
        }
    }

    #[tokio::test]
    async fn cold_build_error_rebalances_busy_count() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        let vms = Arc::new(nimbus_vm::VmManager::new(
            nimbus_vm::VmManagerConfig {
                binary_path: "/usr/bin/firecracker".into(),
                kernel_path: "/var/lib/nimbus/vmlinux".into(),
                rootfs_dir: dir.path().to_path_buf(),
                socket_dir: dir.path().join("sock"),
                vsock_dir: dir.path().join("vsock"),
                log_dir: dir.path().join("log"),
            },
            network,
        ));

        let scheduler = Scheduler::new(
            vms,
            Arc::new(NullMetadataStore),
            Arc::new(NullTelemetry),
            SchedulerConfig::default(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let err = scheduler
            .execute(&sample_function(), serde_json::json!({}), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::VmLaunchFailed(_)));

        let stats = scheduler.stats().await;
        let entry = stats.get("python3.11").unwrap();
        assert_eq!(entry.busy, 0, "busy_count must be released on acquire failure");
    }
}
