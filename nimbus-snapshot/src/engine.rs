//! Snapshot Engine (§4.D): materializes a restorable snapshot for a function
//! version by booting a throwaway VM, driving it through `init`/`warmup`, and
//! asking the VM Manager to freeze it.
//!
//! Grounded on `sandbox-fc/src/snapshot.rs`'s `create_snapshot` pipeline (work
//! dir -> spawn -> configure -> start -> pause -> snapshot -> move artifacts
//! -> always cleanup), collapsed onto the higher-level `nimbus-vm`/
//! `nimbus-transport` APIs instead of driving Firecracker's API directly —
//! those crates already own that layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nimbus_proto::InitPayload;
use nimbus_transport::{GUEST_PORT, Transport};
use nimbus_vm::VmManager;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::MetadataStore;
use crate::error::{Result, SnapshotError};
use crate::model::{Function, Snapshot, SnapshotStatus};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const WARMUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SnapshotEngine {
    vms: Arc<VmManager>,
    metadata: Arc<dyn MetadataStore>,
}

impl SnapshotEngine {
    pub fn new(vms: Arc<VmManager>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { vms, metadata }
    }

    /// §4.D `build`: returns `(mem_bytes, state_bytes)` on success. On any
    /// step's failure the Snapshot row is recorded `Failed` and partial files
    /// are removed; the throwaway VM is destroyed unconditionally either way.
    pub async fn build(&self, function: &Function, out_dir: &Path) -> Result<(u64, u64)> {
        tokio::fs::create_dir_all(out_dir).await?;
        let mut snapshot = Snapshot::building(function, out_dir);
        self.metadata.upsert_snapshot(snapshot.clone()).await;

        let vm = self
            .vms
            .create(&function.runtime, function.memory_mib, function.vcpus)
            .await
            .map_err(SnapshotError::from)?;

        let result = self.build_with_vm(function, out_dir, vm.vm_id, &vm.vsock_uds_path).await;
        self.vms.destroy(vm.vm_id).await;

        match result {
            Ok((mem_bytes, state_bytes)) => {
                snapshot.mem_bytes = mem_bytes;
                snapshot.state_bytes = state_bytes;
                snapshot.status = SnapshotStatus::Ready;
                self.metadata.upsert_snapshot(snapshot).await;
                Ok((mem_bytes, state_bytes))
            }
            Err(e) => {
                self.metadata
                    .update_snapshot_status(
                        &function.id,
                        function.version,
                        &function.env_vars_hash,
                        SnapshotStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await;
                let mem_path = PathBuf::from(&snapshot.mem_path);
                let state_path = PathBuf::from(&snapshot.state_path);
                for path in [mem_path, state_path] {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Err(e)
            }
        }
    }

    async fn build_with_vm(
        &self,
        function: &Function,
        out_dir: &Path,
        vm_id: Uuid,
        vsock_uds_path: &Path,
    ) -> Result<(u64, u64)> {
        let deadline = Instant::now() + INIT_TIMEOUT;
        let mut transport = Transport::connect(vsock_uds_path, GUEST_PORT, deadline).await?;

        let payload = InitPayload {
            function_id: function.id.clone(),
            handler: function.handler.clone(),
            code_bytes: function.code_bytes.clone(),
            runtime: function.runtime.clone(),
            env_vars: function.env_vars.clone(),
            memory_limit_mib: function.memory_mib,
            timeout_sec: function.timeout_sec,
        };
        let resp = transport.init(payload, deadline).await?;
        if !resp.ok {
            return Err(SnapshotError::InitFailed(
                resp.error.unwrap_or_else(|| "guest rejected init".into()),
            ));
        }

        // Best-effort warmup (§4.D step 3): errors are logged, never fatal.
        let warmup_deadline = Instant::now() + WARMUP_TIMEOUT;
        if let Err(e) = transport.warmup(warmup_deadline).await {
            warn!(%vm_id, error = %e, "warmup failed, continuing");
        }
        transport.close();

        let mem_path = out_dir.join("mem");
        let state_path = out_dir.join("state");
        self.vms
            .snapshot(vm_id, &mem_path, &state_path)
            .await
            .map_err(|e| SnapshotError::SnapshotFailed(e.to_string()))?;

        let mem_bytes = tokio::fs::metadata(&mem_path).await?.len();
        let state_bytes = tokio::fs::metadata(&state_path).await?.len();

        info!(%vm_id, mem_bytes, state_bytes, "snapshot built");
        Ok((mem_bytes, state_bytes))
    }

    /// `destroy_snapshot` (§6.1): remove every snapshot row for
    /// `(function_id, version)` and their files immediately, regardless of
    /// grace period. The public interface takes no `env_vars_hash` — rows are
    /// keyed on the full `(function_id, version, env_vars_hash)` fingerprint,
    /// so more than one may coexist under the same `(function_id, version)`
    /// and all of them must go.
    pub async fn destroy(&self, function_id: &str, version: u64) -> Result<()> {
        let matching: Vec<Snapshot> = self
            .metadata
            .list_all_snapshots()
            .await
            .into_iter()
            .filter(|s| s.function_id == function_id && s.version == version)
            .collect();
        for snapshot in matching {
            for path in [&snapshot.mem_path, &snapshot.state_path] {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(SnapshotError::SnapshotFailed(format!(
                            "remove {path}: {e}"
                        )));
                    }
                }
            }
            self.metadata
                .remove_snapshot(function_id, version, &snapshot.env_vars_hash)
                .await;
        }
        Ok(())
    }

    /// §4.E's snapshot sweeper: delete on-disk files for snapshots that have
    /// sat `Expired` for longer than `grace`, then drop their metadata row.
    pub async fn sweep_expired(&self, grace: Duration) -> usize {
        let cutoff = chrono::Utc::now() - grace;
        let expired = self.metadata.list_expired_before(cutoff).await;
        let mut swept = 0;
        for snapshot in expired {
            for path in [&snapshot.mem_path, &snapshot.state_path] {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path, error = %e, "failed to remove expired snapshot file");
                    }
                }
            }
            self.metadata
                .remove_snapshot(&snapshot.function_id, snapshot.version, &snapshot.env_vars_hash)
                .await;
            swept += 1;
        }
        swept
    }
}
