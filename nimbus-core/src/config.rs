use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NimbusError, Result};

pub(crate) const DEFAULT_WARM_CAP: usize = 4;
pub(crate) const DEFAULT_IDLE_TTL_SECONDS: u64 = 600;
pub(crate) const DEFAULT_EXPIRY_GRACE_SECONDS: u64 = 3600;

/// Top-level `nimbus.yaml` shape (§6.4). Relative paths resolve against the
/// config file's own directory, mirroring the teacher's `RunnerConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NimbusConfig {
    pub firecracker: FirecrackerConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    /// Holds one base rootfs image per runtime, `{runtime}.ext4`, under a
    /// `base/` subdirectory — see `nimbus_vm::VmManagerConfig`.
    pub rootfs_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub vsock_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// A `/16` CIDR (e.g. `10.200.0.0/16`) the allocator carves into `/30`s.
    pub bridge_pool_cidr: String,
    pub uplink_iface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub warm_cap_per_fingerprint: usize,
    pub idle_ttl_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_cap_per_fingerprint: DEFAULT_WARM_CAP,
            idle_ttl_seconds: DEFAULT_IDLE_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Base directory under which `build_snapshot` lays out
    /// `{function_id}/{version}/{mem,state}` (§6.3).
    pub dir: PathBuf,
    pub expiry_grace_seconds: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("snapshots"),
            expiry_grace_seconds: DEFAULT_EXPIRY_GRACE_SECONDS,
        }
    }
}

impl NetworkConfig {
    /// The bridge pool's base address, ignoring any prefix length — the
    /// allocator only ever needs the `/16` network address itself.
    pub fn bridge_pool_base(&self) -> Result<Ipv4Addr> {
        let addr_part = self.bridge_pool_cidr.split('/').next().unwrap_or("");
        addr_part
            .parse()
            .map_err(|_| NimbusError::Config(format!("invalid bridge_pool_cidr: {}", self.bridge_pool_cidr)))
    }
}

impl NimbusConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.firecracker.binary);
        resolve(&mut self.firecracker.kernel);
        resolve(&mut self.firecracker.rootfs_dir);
        resolve(&mut self.firecracker.socket_dir);
        resolve(&mut self.firecracker.vsock_dir);
        resolve(&mut self.firecracker.log_dir);
        resolve(&mut self.snapshot.dir);
    }

    pub fn vm_manager_config(&self) -> nimbus_vm::VmManagerConfig {
        nimbus_vm::VmManagerConfig {
            binary_path: self.firecracker.binary.clone(),
            kernel_path: self.firecracker.kernel.clone(),
            rootfs_dir: self.firecracker.rootfs_dir.clone(),
            socket_dir: self.firecracker.socket_dir.clone(),
            vsock_dir: self.firecracker.vsock_dir.clone(),
            log_dir: self.firecracker.log_dir.clone(),
        }
    }

    pub fn network_allocator_config(&self) -> Result<nimbus_network::NetworkAllocatorConfig> {
        Ok(nimbus_network::NetworkAllocatorConfig {
            bridge_pool_base: self.network.bridge_pool_base()?,
            uplink_iface: self.network.uplink_iface.clone(),
        })
    }

    pub fn scheduler_config(&self) -> nimbus_scheduler::SchedulerConfig {
        nimbus_scheduler::SchedulerConfig {
            warm_cap_per_fingerprint: self.pool.warm_cap_per_fingerprint,
            idle_ttl: Duration::from_secs(self.pool.idle_ttl_seconds),
        }
    }

    pub fn expiry_grace(&self) -> Duration {
        Duration::from_secs(self.snapshot.expiry_grace_seconds)
    }
}

/// Load and validate a config from a YAML file (§6.4).
///
/// Relative paths are resolved against the config file's parent directory;
/// directories created on demand at runtime (`socket_dir`, `vsock_dir`,
/// `log_dir`, `snapshot.dir`) are not required to already exist.
pub async fn load(path: &Path) -> Result<NimbusConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| NimbusError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: NimbusConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| NimbusError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate_paths(&config).await?;
    Ok(config)
}

/// Write a populated template to `path`, creating its parent directory.
pub async fn generate(path: &Path, config: &NimbusConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| NimbusError::Config(format!("create {}: {e}", parent.display())))?;
    }
    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| NimbusError::Config(format!("serialize config: {e}")))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| NimbusError::Config(format!("write {}: {e}", path.display())))?;
    Ok(())
}

async fn check_path_exists(path: &Path, label: &str) -> Result<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| NimbusError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(NimbusError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate_paths(config: &NimbusConfig) -> Result<()> {
    check_path_exists(&config.firecracker.binary, "firecracker binary").await?;
    check_path_exists(&config.firecracker.kernel, "kernel").await?;
    check_path_exists(&config.firecracker.rootfs_dir, "rootfs_dir").await?;
    Ok(())
}

pub fn default_template(dir: &Path) -> NimbusConfig {
    NimbusConfig {
        firecracker: FirecrackerConfig {
            binary: dir.join("firecracker"),
            kernel: dir.join("vmlinux"),
            rootfs_dir: dir.join("rootfs"),
            socket_dir: dir.join("run/sock"),
            vsock_dir: dir.join("run/vsock"),
            log_dir: dir.join("log"),
        },
        network: NetworkConfig {
            bridge_pool_cidr: "10.200.0.0/16".into(),
            uplink_iface: "eth0".into(),
        },
        pool: PoolConfig::default(),
        snapshot: SnapshotConfig {
            dir: dir.join("snapshots"),
            ..SnapshotConfig::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("artifacts");
        tokio::fs::create_dir_all(&sub).await.unwrap();
        for name in ["firecracker", "vmlinux"] {
            tokio::fs::write(sub.join(name), b"").await.unwrap();
        }
        tokio::fs::create_dir_all(sub.join("rootfs")).await.unwrap();

        let yaml = r#"
firecracker:
  binary: artifacts/firecracker
  kernel: artifacts/vmlinux
  rootfs_dir: artifacts/rootfs
  socket_dir: run/sock
  vsock_dir: run/vsock
  log_dir: log
network:
  bridge_pool_cidr: 10.200.0.0/16
  uplink_iface: eth0
snapshot:
  dir: snapshots
  expiry_grace_seconds: 3600
"#;
        let config_path = dir.path().join("nimbus.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.firecracker.binary, sub.join("firecracker"));
        assert_eq!(config.firecracker.rootfs_dir, sub.join("rootfs"));
        assert_eq!(config.pool.warm_cap_per_fingerprint, DEFAULT_WARM_CAP);
    }

    #[tokio::test]
    async fn load_fails_on_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
firecracker:
  binary: /nonexistent/firecracker
  kernel: /nonexistent/kernel
  rootfs_dir: /nonexistent/rootfs
  socket_dir: run/sock
  vsock_dir: run/vsock
  log_dir: log
network:
  bridge_pool_cidr: 10.200.0.0/16
  uplink_iface: eth0
snapshot:
  dir: snapshots
  expiry_grace_seconds: 3600
"#;
        let config_path = dir.path().join("nimbus.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "got: {err}");
    }

    #[tokio::test]
    async fn generate_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fc = dir.path().join("firecracker");
        let kernel = dir.path().join("vmlinux");
        let rootfs = dir.path().join("rootfs");
        tokio::fs::write(&fc, b"").await.unwrap();
        tokio::fs::write(&kernel, b"").await.unwrap();
        tokio::fs::create_dir_all(&rootfs).await.unwrap();

        let mut config = default_template(dir.path());
        config.firecracker.binary = fc;
        config.firecracker.kernel = kernel;
        config.firecracker.rootfs_dir = rootfs;

        let config_path = dir.path().join("nimbus.yaml");
        generate(&config_path, &config).await.unwrap();

        let loaded = load(&config_path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn bridge_pool_base_parses_address_portion() {
        let net = NetworkConfig {
            bridge_pool_cidr: "10.200.0.0/16".into(),
            uplink_iface: "eth0".into(),
        };
        assert_eq!(net.bridge_pool_base().unwrap(), Ipv4Addr::new(10, 200, 0, 0));
    }

    #[test]
    fn bridge_pool_base_rejects_garbage() {
        let net = NetworkConfig {
            bridge_pool_cidr: "not-an-ip".into(),
            uplink_iface: "eth0".into(),
        };
        assert!(net.bridge_pool_base().is_err());
    }
}
