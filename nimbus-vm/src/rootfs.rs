//! Per-VM rootfs cloning. §4.B step 2: "clone it into a per-VM file —
//! preferring a copy-on-write reflink; falling back to a byte copy when the
//! filesystem does not support it. The clone is mandatory: no two VMs ever
//! share a writable rootfs."

use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::{debug, warn};

/// Linux `FICLONE` ioctl request number (`_IOW(0x94, 9, int)`), valid on
/// filesystems that support reflink (btrfs, xfs, overlayfs-on-xfs).
const FICLONE: libc::c_ulong = 0x4004_9409;

pub async fn clone_rootfs(src: &Path, dst: &Path) -> std::io::Result<()> {
    let src = src.to_owned();
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || clone_rootfs_blocking(&src, &dst))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn clone_rootfs_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    if try_reflink(src, dst)? {
        debug!(src = %src.display(), dst = %dst.display(), "rootfs cloned via reflink");
        return Ok(());
    }
    warn!(src = %src.display(), dst = %dst.display(), "reflink unsupported, falling back to byte copy");
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Attempts a `FICLONE` reflink. Returns `Ok(true)` on success, `Ok(false)` if
/// the filesystem doesn't support it (caller should fall back to a copy), and
/// `Err` only for failures unrelated to reflink support (e.g. the source file
/// couldn't be opened at all).
fn try_reflink(src: &Path, dst: &Path) -> std::io::Result<bool> {
    let src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;

    let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), FICLONE, src_file.as_raw_fd()) };
    if rc == 0 {
        Ok(true)
    } else {
        let err = std::io::Error::last_os_error();
        let unsupported = matches!(
            err.raw_os_error(),
            Some(libc::EOPNOTSUPP) | Some(libc::EXDEV) | Some(libc::EINVAL)
        );
        if unsupported {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_rootfs_falls_back_to_copy_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.ext4");
        let dst = dir.path().join("clone.ext4");
        tokio::fs::write(&src, b"fake-rootfs-image").await.unwrap();

        clone_rootfs(&src, &dst).await.unwrap();

        let content = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(content, b"fake-rootfs-image");
    }

    #[tokio::test]
    async fn clone_rootfs_produces_independent_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.ext4");
        let dst = dir.path().join("clone.ext4");
        tokio::fs::write(&src, b"v1").await.unwrap();
        clone_rootfs(&src, &dst).await.unwrap();

        tokio::fs::write(&src, b"v2-mutated").await.unwrap();
        let dst_content = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(dst_content, b"v1", "clone must not observe later writes to src");
    }
}
