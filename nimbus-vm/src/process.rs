//! Spawns and reaps the Firecracker child process. Every VM (fresh-boot or
//! restored) is launched the same way: `firecracker --api-sock <path>`, with
//! the rest of its configuration driven over the API afterward — unlike the
//! teacher's `--config-file --no-api` shortcut, every VM here needs its API
//! socket alive for the lifetime of the process so `pause`/`resume`/
//! `snapshot` keep working (§4.B).

use std::path::Path;

use tokio::process::{Child, Command};
use tracing::warn;

use crate::error::{Result, VmError};

pub async fn spawn(binary_path: &Path, api_sock: &Path, log_file: &Path) -> Result<Child> {
    let log = std::fs::File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| VmError::LaunchFailed(format!("open log file: {e}")))?;
    let log_err = log
        .try_clone()
        .map_err(|e| VmError::LaunchFailed(format!("clone log handle: {e}")))?;

    // SAFETY: `pre_exec` only calls async-signal-safe `setsid()`; no heap
    // allocation or locking happens between fork and exec.
    let child = unsafe {
        Command::new(binary_path)
            .arg("--api-sock")
            .arg(api_sock)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(log))
            .stderr(std::process::Stdio::from(log_err))
            .process_group(0)
            .spawn()
    }
    .map_err(|e| VmError::LaunchFailed(format!("spawn firecracker: {e}")))?;

    Ok(child)
}

/// Kill the entire process group (`killpg(SIGKILL)`), requires the child to
/// have been spawned with `process_group(0)` so its PGID equals its PID.
pub fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        match i32::try_from(pid) {
            Ok(pid) => {
                let pgid = nix::unistd::Pid::from_raw(pid);
                if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
                    warn!(pid, error = %e, "killpg failed");
                }
            }
            Err(_) => warn!(pid, "pid does not fit in i32, cannot killpg"),
        }
    }
}
