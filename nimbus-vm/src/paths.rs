//! On-disk layout for one VM's runtime files, mirroring `SandboxPaths`/
//! `SockPaths` but collapsed into a single per-vm_id path set (§6.3).

use std::path::{Path, PathBuf};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct VmPaths {
    socket_dir: PathBuf,
    vsock_dir: PathBuf,
    log_dir: PathBuf,
    rootfs_dir: PathBuf,
}

impl VmPaths {
    pub fn new(socket_dir: PathBuf, vsock_dir: PathBuf, log_dir: PathBuf, rootfs_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            vsock_dir,
            log_dir,
            rootfs_dir,
        }
    }

    pub fn api_sock(&self, vm_id: Uuid) -> PathBuf {
        self.socket_dir.join(format!("{vm_id}.sock"))
    }

    pub fn vsock_uds(&self, vm_id: Uuid) -> PathBuf {
        self.vsock_dir.join(format!("{vm_id}.vsock"))
    }

    pub fn log_file(&self, vm_id: Uuid) -> PathBuf {
        self.log_dir.join(format!("{vm_id}.log"))
    }

    pub fn rootfs_clone(&self, vm_id: Uuid) -> PathBuf {
        self.rootfs_dir.join(format!("{vm_id}.ext4"))
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.socket_dir, &self.vsock_dir, &self.log_dir, &self.rootfs_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn base_rootfs(&self, runtime: &str) -> PathBuf {
        self.rootfs_dir.join("base").join(format!("{runtime}.ext4"))
    }
}

pub fn sun_path_fits(path: &Path) -> bool {
    // sun_path limit is 108 bytes including the NUL terminator.
    path.as_os_str().len() <= 107
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_paths_are_namespaced_by_vm_id() {
        let paths = VmPaths::new("/run/nimbus/sock".into(), "/run/nimbus/vsock".into(), "/var/log/nimbus".into(), "/var/lib/nimbus/rootfs".into());
        let id = Uuid::new_v4();
        assert!(paths.api_sock(id).to_string_lossy().contains(&id.to_string()));
        assert_ne!(paths.api_sock(id), paths.vsock_uds(id));
    }

    #[test]
    fn socket_paths_fit_sun_path_limit() {
        let paths = VmPaths::new("/run/nimbus/sock".into(), "/run/nimbus/vsock".into(), "/var/log/nimbus".into(), "/var/lib/nimbus/rootfs".into());
        let id = Uuid::new_v4();
        assert!(sun_path_fits(&paths.api_sock(id)));
        assert!(sun_path_fits(&paths.vsock_uds(id)));
    }
}
