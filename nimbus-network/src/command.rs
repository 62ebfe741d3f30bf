//! Thin wrapper over `ip`/`iptables` invocations. Args are passed as an argv
//! array (never through a shell), so no value here can be interpreted by a
//! shell even though every argument is host-generated from `vm_id`.

use tokio::process::Command;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    Sudo,
    User,
}

fn display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, CommandError> {
    let cmd_display = display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Same as [`exec`] but never returns an error — used for teardown, where a
/// resource that's already gone must not block the rest of cleanup.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    let cmd_display = display(program, args, privilege);
    trace!(command = %cmd_display, "exec_ignore_errors");

    let output = match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    match output {
        Ok(o) if !o.status.success() => {
            trace!(command = %cmd_display, stderr = %String::from_utf8_lossy(&o.stderr).trim(), "command failed (ignored)");
        }
        Err(e) => trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)"),
        _ => {}
    }
}
