//! The `Nimbus` facade: composes the four components into the five methods
//! §6.1 promises to a caller (gateway, workflow engine) embedding this crate.

use std::sync::Arc;
use std::time::Duration;

use nimbus_network::NetworkAllocator;
use nimbus_scheduler::{ExecuteOutcome, FingerprintStats, Scheduler};
use nimbus_snapshot::{Function, MetadataStore, RootfsRegistry, SnapshotEngine, SnapshotStatus};
use nimbus_vm::VmManager;
use tokio::time::Instant as TokioInstant;
use tracing::{info, warn};

use crate::collaborators::{DirectoryRootfsRegistry, InMemoryMetadataStore, TracingTelemetrySink};
use crate::config::NimbusConfig;
use crate::error::Result;

/// The `snapshot` half of `stats()`'s return shape (§6.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotStats {
    pub ready: usize,
    pub building: usize,
    pub failed: usize,
    pub expired: usize,
    pub total_mem_bytes: u64,
    pub total_state_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NimbusStats {
    pub per_runtime: std::collections::HashMap<String, FingerprintStats>,
    pub snapshot: SnapshotStats,
}

pub struct Nimbus {
    vms: Arc<VmManager>,
    snapshots: Arc<SnapshotEngine>,
    scheduler: Arc<Scheduler>,
    metadata: Arc<dyn MetadataStore>,
    rootfs: Arc<dyn RootfsRegistry>,
    snapshot_dir: std::path::PathBuf,
    expiry_grace: Duration,
}

impl Nimbus {
    /// Wire up every component from a loaded config, using the in-process
    /// default collaborator implementations (§6.2).
    pub fn new(config: &NimbusConfig) -> Result<Self> {
        let network = Arc::new(NetworkAllocator::new(config.network_allocator_config()?));
        let vms = Arc::new(VmManager::new(config.vm_manager_config(), Arc::clone(&network)));
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let telemetry = Arc::new(TracingTelemetrySink);
        let rootfs: Arc<dyn RootfsRegistry> =
            Arc::new(DirectoryRootfsRegistry::new(config.firecracker.rootfs_dir.clone()));

        let snapshots = Arc::new(SnapshotEngine::new(Arc::clone(&vms), Arc::clone(&metadata)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&vms),
            Arc::clone(&metadata),
            telemetry,
            config.scheduler_config(),
        ));

        Ok(Self {
            vms,
            snapshots,
            scheduler,
            metadata,
            rootfs,
            snapshot_dir: config.snapshot.dir.clone(),
            expiry_grace: config.expiry_grace(),
        })
    }

    /// Whether a runtime tag has an installed base rootfs image — used by
    /// `setup` to sanity-check a config before `serve` starts.
    pub async fn runtime_available(&self, runtime: &str) -> bool {
        self.rootfs.base_path_for(runtime).await.is_some()
    }

    /// §6.1 `execute`.
    pub async fn execute(
        &self,
        function: &Function,
        payload: serde_json::Value,
        deadline: TokioInstant,
    ) -> Result<ExecuteOutcome> {
        self.metadata.upsert_function(function.clone()).await;
        Ok(self.scheduler.execute(function, payload, deadline).await?)
    }

    /// §6.1 `build_snapshot`: lays the pair out at
    /// `{snapshot_dir}/{function_id}/{version}/{mem,state}` and invalidates
    /// any earlier snapshot for the same function first (§4.D).
    pub async fn build_snapshot(&self, function: &Function) -> Result<(u64, u64)> {
        self.metadata.expire_stale(&function.id, function).await;
        let out_dir = self
            .snapshot_dir
            .join(&function.id)
            .join(function.version.to_string());
        Ok(self.snapshots.build(function, &out_dir).await?)
    }

    /// §6.1 `destroy_snapshot`.
    pub async fn destroy_snapshot(&self, function_id: &str, version: u64) -> Result<()> {
        Ok(self.snapshots.destroy(function_id, version).await?)
    }

    /// §6.1 `stats`.
    pub async fn stats(&self) -> NimbusStats {
        let per_runtime = self.scheduler.stats().await;
        let mut snapshot = SnapshotStats::default();
        for snap in self.metadata.list_all_snapshots().await {
            match snap.status {
                SnapshotStatus::Ready => snapshot.ready += 1,
                SnapshotStatus::Building => snapshot.building += 1,
                SnapshotStatus::Failed => snapshot.failed += 1,
                SnapshotStatus::Expired => snapshot.expired += 1,
            }
            snapshot.total_mem_bytes += snap.mem_bytes;
            snapshot.total_state_bytes += snap.state_bytes;
        }
        NimbusStats { per_runtime, snapshot }
    }

    /// §6.1 `shutdown`: drain the scheduler's warm pools, then tear down
    /// whatever VMs and network state remain.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.vms.shutdown().await;
    }

    /// Runs the §4.E background sweepers once: idle-VM eviction, expired-
    /// snapshot-file deletion, and orphaned-rootfs-clone GC. The `serve`
    /// subcommand calls this on an interval.
    pub async fn sweep(&self) {
        self.scheduler.sweep_idle().await;
        let swept = self.snapshots.sweep_expired(self.expiry_grace).await;
        if swept > 0 {
            info!(swept, "swept expired snapshots");
        }
        match self.vms.gc_orphaned_rootfs().await {
            Ok(removed) if removed > 0 => info!(removed, "gc'd orphaned rootfs clones"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "rootfs gc failed"),
        }
    }

}
