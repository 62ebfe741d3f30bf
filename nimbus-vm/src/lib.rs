//! VM Manager (component B): the single source of truth for the set of live
//! Firecracker VMs. Owns create/introspect/pause/resume/snapshot/destroy.
//!
//! Concurrency model (§4.B): the registry is a reader/writer lock; each VM
//! additionally has its own mutex (`op_lock`) serializing pause/resume/
//! snapshot against a concurrent `destroy`. `destroy` removes the VM from the
//! registry *before* doing any teardown, so no new operation can find it —
//! mirroring `FirecrackerFactory::destroy`'s "kill first, release pools
//! after" ordering.

mod api;
mod config;
mod error;
mod paths;
mod process;
mod rootfs;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub use config::VmManagerConfig;
pub use error::{Result, VmError};

use api::ApiClient;
use config::KERNEL_BOOT_ARGS;
use paths::VmPaths;

const API_READY_TIMEOUT: Duration = Duration::from_secs(5);
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// First CID handed out; §3: "values 0-2 reserved, 3-99 treated as system
/// reservations".
const FIRST_CID: u32 = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Creating = 0,
    Running = 1,
    Paused = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl VmState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Creating,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A point-in-time, read-only view of a live VM (§3's `VM` data model).
#[derive(Debug, Clone)]
pub struct Vm {
    pub vm_id: Uuid,
    pub runtime: String,
    pub state: VmState,
    pub cid: u32,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub api_sock: PathBuf,
    pub rootfs_path: PathBuf,
    pub vsock_uds_path: PathBuf,
    pub log_path: PathBuf,
    pub host_ip: Ipv4Addr,
    pub created_at: SystemTime,
    pub last_used_at: SystemTime,
    pub use_count: u64,
}

struct VmEntry {
    vm_id: Uuid,
    runtime: String,
    cid: u32,
    memory_mib: u32,
    vcpus: u32,
    api_sock: PathBuf,
    rootfs_path: PathBuf,
    vsock_uds_path: PathBuf,
    log_path: PathBuf,
    host_ip: Ipv4Addr,
    created_at: SystemTime,
    last_used_at: std::sync::Mutex<SystemTime>,
    use_count: AtomicU64,
    state: AtomicU8,
    process: AsyncMutex<Option<Child>>,
    /// Serializes pause/resume/snapshot against a concurrent destroy.
    op_lock: AsyncMutex<()>,
}

impl VmEntry {
    fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: VmState, to: VmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn snapshot_view(&self) -> Vm {
        Vm {
            vm_id: self.vm_id,
            runtime: self.runtime.clone(),
            state: self.state(),
            cid: self.cid,
            memory_mib: self.memory_mib,
            vcpus: self.vcpus,
            api_sock: self.api_sock.clone(),
            rootfs_path: self.rootfs_path.clone(),
            vsock_uds_path: self.vsock_uds_path.clone(),
            log_path: self.log_path.clone(),
            host_ip: self.host_ip,
            created_at: self.created_at,
            last_used_at: *self
                .last_used_at
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
            use_count: self.use_count.load(Ordering::Relaxed),
        }
    }
}

pub struct VmManager {
    config: VmManagerConfig,
    network: Arc<nimbus_network::NetworkAllocator>,
    paths: VmPaths,
    registry: RwLock<HashMap<Uuid, Arc<VmEntry>>>,
    next_cid: AtomicU32,
}

impl VmManager {
    pub fn new(config: VmManagerConfig, network: Arc<nimbus_network::NetworkAllocator>) -> Self {
        let paths = VmPaths::new(
            config.socket_dir.clone(),
            config.vsock_dir.clone(),
            config.log_dir.clone(),
            config.rootfs_dir.clone(),
        );
        Self {
            config,
            network,
            paths,
            registry: RwLock::new(HashMap::new()),
            next_cid: AtomicU32::new(FIRST_CID),
        }
    }

    /// §4.B `create`: assign identity, clone rootfs, allocate network, launch
    /// Firecracker, drive it to `Running` over its API. Every step rolls back
    /// everything done by the steps before it on failure.
    pub async fn create(&self, runtime: &str, memory_mib: u32, vcpus: u32) -> Result<Vm> {
        let vm_id = Uuid::new_v4();
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);

        self.paths
            .ensure_dirs()
            .await
            .map_err(|e| VmError::LaunchFailed(format!("prepare directories: {e}")))?;

        let base_rootfs = self.paths.base_rootfs(runtime);
        if !tokio::fs::try_exists(&base_rootfs).await.unwrap_or(false) {
            return Err(VmError::RuntimeNotFound(runtime.to_string()));
        }

        let rootfs_path = self.paths.rootfs_clone(vm_id);
        rootfs::clone_rootfs(&base_rootfs, &rootfs_path)
            .await
            .map_err(|e| VmError::LaunchFailed(format!("clone rootfs: {e}")))?;

        let net = match self.network.setup(vm_id).await {
            Ok(net) => net,
            Err(e) => {
                let _ = tokio::fs::remove_file(&rootfs_path).await;
                return Err(e.into());
            }
        };

        let api_sock = self.paths.api_sock(vm_id);
        let vsock_uds_path = self.paths.vsock_uds(vm_id);
        let log_path = self.paths.log_file(vm_id);

        let result = self.boot_fresh(vm_id, cid, memory_mib, vcpus, &api_sock, &vsock_uds_path, &log_path, &rootfs_path, &net).await;

        let process = match result {
            Ok(child) => child,
            Err(e) => {
                self.network.cleanup(vm_id).await;
                let _ = tokio::fs::remove_file(&rootfs_path).await;
                return Err(e);
            }
        };

        let entry = Arc::new(VmEntry {
            vm_id,
            runtime: runtime.to_string(),
            cid,
            memory_mib,
            vcpus,
            api_sock,
            rootfs_path,
            vsock_uds_path,
            log_path,
            host_ip: net.host_ip,
            created_at: SystemTime::now(),
            last_used_at: std::sync::Mutex::new(SystemTime::now()),
            use_count: AtomicU64::new(0),
            state: AtomicU8::new(VmState::Running as u8),
            process: AsyncMutex::new(Some(process)),
            op_lock: AsyncMutex::new(()),
        });

        self.registry.write().await.insert(vm_id, Arc::clone(&entry));
        info!(%vm_id, cid, runtime, "vm created");
        Ok(entry.snapshot_view())
    }

    #[allow(clippy::too_many_arguments)]
    async fn boot_fresh(
        &self,
        vm_id: Uuid,
        cid: u32,
        memory_mib: u32,
        vcpus: u32,
        api_sock: &std::path::Path,
        vsock_uds_path: &std::path::Path,
        log_path: &std::path::Path,
        rootfs_path: &std::path::Path,
        net: &nimbus_network::NetworkConfig,
    ) -> Result<Child> {
        let mut child = process::spawn(&self.config.binary_path, api_sock, log_path).await?;
        let api = ApiClient::new(api_sock);
        if let Err(e) = self.configure_and_start(&api, cid, memory_mib, vcpus, vsock_uds_path, rootfs_path, net).await {
            process::kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }
        info!(%vm_id, "firecracker started (fresh boot)");
        Ok(child)
    }

    #[allow(clippy::too_many_arguments)]
    async fn configure_and_start(
        &self,
        api: &ApiClient,
        cid: u32,
        memory_mib: u32,
        vcpus: u32,
        vsock_uds_path: &std::path::Path,
        rootfs_path: &std::path::Path,
        net: &nimbus_network::NetworkConfig,
    ) -> Result<()> {
        api.wait_for_ready(API_READY_TIMEOUT).await?;

        api.put(
            "/boot-source",
            &serde_json::json!({
                "kernel_image_path": self.config.kernel_path.display().to_string(),
                "boot_args": KERNEL_BOOT_ARGS,
            }),
        )
        .await?;

        api.put(
            "/drives/rootfs",
            &serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": rootfs_path.display().to_string(),
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        api.put(
            "/machine-config",
            &serde_json::json!({
                "vcpu_count": vcpus,
                "mem_size_mib": memory_mib,
            }),
        )
        .await?;

        api.put(
            "/network-interfaces/eth0",
            &serde_json::json!({
                "iface_id": "eth0",
                "guest_mac": net.mac,
                "host_dev_name": net.tap_name,
            }),
        )
        .await?;

        api.put(
            "/vsock",
            &serde_json::json!({
                "guest_cid": cid,
                "uds_path": vsock_uds_path.display().to_string(),
            }),
        )
        .await?;

        api.put(
            "/actions",
            &serde_json::json!({"action_type": "InstanceStart"}),
        )
        .await?;

        Ok(())
    }

    pub async fn get(&self, vm_id: Uuid) -> Option<Vm> {
        self.registry
            .read()
            .await
            .get(&vm_id)
            .map(|e| e.snapshot_view())
    }

    pub async fn list(&self) -> Vec<Vm> {
        self.registry
            .read()
            .await
            .values()
            .map(|e| e.snapshot_view())
            .collect()
    }

    async fn entry(&self, vm_id: Uuid) -> Result<Arc<VmEntry>> {
        self.registry
            .read()
            .await
            .get(&vm_id)
            .cloned()
            .ok_or(VmError::NotFound(vm_id))
    }

    pub async fn pause(&self, vm_id: Uuid) -> Result<()> {
        let entry = self.entry(vm_id).await?;
        let _op = entry.op_lock.lock().await;
        if entry.state() == VmState::Paused {
            return Ok(());
        }
        let api = ApiClient::new(&entry.api_sock);
        api.patch("/vm", &serde_json::json!({"state": "Paused"}))
            .await
            .map_err(|e| VmError::PauseFailed(e.to_string()))?;
        entry.transition(VmState::Running, VmState::Paused);
        Ok(())
    }

    pub async fn resume(&self, vm_id: Uuid) -> Result<()> {
        let entry = self.entry(vm_id).await?;
        let _op = entry.op_lock.lock().await;
        if entry.state() == VmState::Running {
            return Ok(());
        }
        let api = ApiClient::new(&entry.api_sock);
        api.patch("/vm", &serde_json::json!({"state": "Resumed"}))
            .await
            .map_err(|e| VmError::PauseFailed(e.to_string()))?;
        entry.transition(VmState::Paused, VmState::Running);
        Ok(())
    }

    /// §4.D step 4: pause, write memory+state, leave paused. If the write
    /// fails after pausing, resume is attempted before returning the error so
    /// the VM is never left indeterminate.
    pub async fn snapshot(&self, vm_id: Uuid, mem_path: &std::path::Path, state_path: &std::path::Path) -> Result<()> {
        let entry = self.entry(vm_id).await?;
        let _op = entry.op_lock.lock().await;

        let was_running = entry.state() == VmState::Running;
        if was_running {
            let api = ApiClient::new(&entry.api_sock);
            api.patch("/vm", &serde_json::json!({"state": "Paused"}))
                .await
                .map_err(|e| VmError::PauseFailed(e.to_string()))?;
            entry.transition(VmState::Running, VmState::Paused);
        }

        let api = ApiClient::new(&entry.api_sock);
        let result = api
            .put(
                "/snapshot/create",
                &serde_json::json!({
                    "snapshot_path": state_path.display().to_string(),
                    "mem_file_path": mem_path.display().to_string(),
                }),
            )
            .await;

        if let Err(e) = result {
            if was_running {
                let _ = api
                    .patch("/vm", &serde_json::json!({"state": "Resumed"}))
                    .await;
                entry.transition(VmState::Paused, VmState::Running);
            }
            return Err(VmError::SnapshotIoError(e.to_string()));
        }

        Ok(())
    }

    /// §4.B `restore`: fresh `vm_id`/CID, fresh network (guest IP is
    /// reproduced by construction — see `nimbus-network`'s module docs),
    /// Firecracker launched pointing at the two snapshot files.
    pub async fn restore(&self, snapshot_mem: &std::path::Path, snapshot_state: &std::path::Path, runtime: &str) -> Result<Vm> {
        for path in [snapshot_mem, snapshot_state] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(VmError::SnapshotMissing(path.display().to_string()));
            }
        }

        let vm_id = Uuid::new_v4();
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        self.paths
            .ensure_dirs()
            .await
            .map_err(|e| VmError::LaunchFailed(format!("prepare directories: {e}")))?;

        let net = self.network.setup(vm_id).await?;
        let api_sock = self.paths.api_sock(vm_id);
        let vsock_uds_path = self.paths.vsock_uds(vm_id);
        let log_path = self.paths.log_file(vm_id);

        let result = self
            .boot_from_snapshot(vm_id, &api_sock, &log_path, snapshot_mem, snapshot_state)
            .await;

        let process = match result {
            Ok(child) => child,
            Err(e) => {
                self.network.cleanup(vm_id).await;
                return Err(e);
            }
        };

        let entry = Arc::new(VmEntry {
            vm_id,
            runtime: runtime.to_string(),
            cid,
            memory_mib: 0,
            vcpus: 0,
            api_sock,
            rootfs_path: PathBuf::new(),
            vsock_uds_path,
            log_path,
            host_ip: net.host_ip,
            created_at: SystemTime::now(),
            last_used_at: std::sync::Mutex::new(SystemTime::now()),
            use_count: AtomicU64::new(0),
            state: AtomicU8::new(VmState::Running as u8),
            process: AsyncMutex::new(Some(process)),
            op_lock: AsyncMutex::new(()),
        });

        self.registry.write().await.insert(vm_id, Arc::clone(&entry));
        info!(%vm_id, cid, "vm restored from snapshot");
        Ok(entry.snapshot_view())
    }

    async fn boot_from_snapshot(
        &self,
        vm_id: Uuid,
        api_sock: &std::path::Path,
        log_path: &std::path::Path,
        snapshot_mem: &std::path::Path,
        snapshot_state: &std::path::Path,
    ) -> Result<Child> {
        let mut child = process::spawn(&self.config.binary_path, api_sock, log_path).await?;
        let api = ApiClient::new(api_sock);
        if let Err(e) = self.load_snapshot(&api, snapshot_mem, snapshot_state).await {
            process::kill_process_group(&child);
            let _ = child.wait().await;
            return Err(e);
        }
        info!(%vm_id, "firecracker started (snapshot restore)");
        Ok(child)
    }

    async fn load_snapshot(
        &self,
        api: &ApiClient,
        snapshot_mem: &std::path::Path,
        snapshot_state: &std::path::Path,
    ) -> Result<()> {
        api.wait_for_ready(API_READY_TIMEOUT).await?;
        api.put(
            "/snapshot/load",
            &serde_json::json!({
                "snapshot_path": snapshot_state.display().to_string(),
                "mem_file_path": snapshot_mem.display().to_string(),
                "resume_vm": true,
            }),
        )
        .await?;
        Ok(())
    }

    /// §4.B `destroy`: never fails externally. Removed from the registry
    /// first so no new operation can target it, then best-effort teardown.
    pub async fn destroy(&self, vm_id: Uuid) {
        let entry = match self.registry.write().await.remove(&vm_id) {
            Some(e) => e,
            None => return,
        };

        let _op = entry.op_lock.lock().await;
        entry.state.store(VmState::Stopping as u8, Ordering::Release);

        let api = ApiClient::new(&entry.api_sock);
        let graceful = time_bounded(
            GRACEFUL_SHUTDOWN_TIMEOUT,
            api.put("/actions", &serde_json::json!({"action_type": "SendCtrlAltDel"})),
        )
        .await;

        let mut process_guard = entry.process.lock().await;
        if let Some(child) = process_guard.as_mut() {
            if graceful.is_err() {
                process::kill_process_group(child);
            }
            let _ = child.wait().await;
        }
        *process_guard = None;
        drop(process_guard);

        self.network.cleanup(vm_id).await;

        for path in [&entry.api_sock, &entry.vsock_uds_path, &entry.rootfs_path] {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(%vm_id, path = %path.display(), error = %e, "failed to remove vm file");
            }
        }

        entry.state.store(VmState::Stopped as u8, Ordering::Release);
        info!(%vm_id, "vm destroyed");
    }

    /// §4.B `shutdown`: destroy every live VM. Called on process exit.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.registry.read().await.keys().copied().collect();
        for vm_id in ids {
            self.destroy(vm_id).await;
        }
        info!("vm manager shutdown complete");
    }

    /// Bump `last_used_at`/`use_count` — called by the Scheduler around an
    /// invocation so warm-pool idle-TTL bookkeeping has fresh data.
    pub async fn mark_used(&self, vm_id: Uuid) {
        if let Ok(entry) = self.entry(vm_id).await {
            *entry
                .last_used_at
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = SystemTime::now();
            entry.use_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// §4.E's orphan sweeper: remove rootfs clones in `rootfs_dir` whose
    /// `vm_id` stem is not a live registry entry. Runs after a crash or an
    /// unclean shutdown leaves clone files behind a `destroy` never reached.
    pub async fn gc_orphaned_rootfs(&self) -> Result<usize> {
        let live: std::collections::HashSet<Uuid> =
            self.registry.read().await.keys().copied().collect();

        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.config.rootfs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(VmError::LaunchFailed(format!("read rootfs_dir: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VmError::LaunchFailed(format!("scan rootfs_dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ext4") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(vm_id) = Uuid::parse_str(stem) else {
                continue;
            };
            if !live.contains(&vm_id) {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    warn!(%vm_id, "removed orphaned rootfs clone");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

async fn time_bounded<T>(timeout: Duration, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(VmError::LaunchFailed("timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_round_trips_through_u8() {
        for state in [
            VmState::Creating,
            VmState::Running,
            VmState::Paused,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Failed,
        ] {
            assert_eq!(VmState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn get_on_empty_manager_returns_none() {
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        let config = VmManagerConfig {
            binary_path: "/usr/bin/firecracker".into(),
            kernel_path: "/var/lib/nimbus/vmlinux".into(),
            rootfs_dir: "/var/lib/nimbus/rootfs".into(),
            socket_dir: "/run/nimbus/sock".into(),
            vsock_dir: "/run/nimbus/vsock".into(),
            log_dir: "/var/log/nimbus".into(),
        };
        let manager = VmManager::new(config, network);
        assert!(manager.get(Uuid::new_v4()).await.is_none());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn create_fails_fast_when_runtime_rootfs_missing() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        let config = VmManagerConfig {
            binary_path: "/usr/bin/firecracker".into(),
            kernel_path: "/var/lib/nimbus/vmlinux".into(),
            rootfs_dir: dir.path().to_path_buf(),
            socket_dir: dir.path().join("sock"),
            vsock_dir: dir.path().join("vsock"),
            log_dir: dir.path().join("log"),
        };
        let manager = VmManager::new(config, network);
        let err = manager.create("python3.11", 128, 1).await.unwrap_err();
        assert!(matches!(err, VmError::RuntimeNotFound(_)));
    }

    #[tokio::test]
    async fn destroy_of_unknown_vm_id_is_a_noop() {
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        let config = VmManagerConfig {
            binary_path: "/usr/bin/firecracker".into(),
            kernel_path: "/var/lib/nimbus/vmlinux".into(),
            rootfs_dir: "/var/lib/nimbus/rootfs".into(),
            socket_dir: "/run/nimbus/sock".into(),
            vsock_dir: "/run/nimbus/vsock".into(),
            log_dir: "/var/log/nimbus".into(),
        };
        let manager = VmManager::new(config, network);
        manager.destroy(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn gc_orphaned_rootfs_removes_files_with_no_live_vm() {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(nimbus_network::NetworkAllocator::new(
            nimbus_network::NetworkAllocatorConfig::default(),
        ));
        let config = VmManagerConfig {
            binary_path: "/usr/bin/firecracker".into(),
            kernel_path: "/var/lib/nimbus/vmlinux".into(),
            rootfs_dir: dir.path().to_path_buf(),
            socket_dir: dir.path().join("sock"),
            vsock_dir: dir.path().join("vsock"),
            log_dir: dir.path().join("log"),
        };
        let manager = VmManager::new(config, network);

        let orphan_id = Uuid::new_v4();
        tokio::fs::write(dir.path().join(format!("{orphan_id}.ext4")), b"").await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("base")).await.unwrap();
        tokio::fs::write(dir.path().join("base").join("python3.11.ext4"), b"").await.unwrap();

        let removed = manager.gc_orphaned_rootfs().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!tokio::fs::try_exists(dir.path().join(format!("{orphan_id}.ext4"))).await.unwrap());
        assert!(tokio::fs::try_exists(dir.path().join("base").join("python3.11.ext4")).await.unwrap());
    }
}
