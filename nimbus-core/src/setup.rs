//! `setup` subcommand: sanity-checks a host before `serve` is asked to boot
//! real VMs on it. Trimmed down from the teacher's `runner::setup`, which
//! also downloads and SHA256-verifies Firecracker/kernel/mitmdump binaries —
//! out of scope here, since this core only drives an already-installed
//! Firecracker rather than provisioning one.

use crate::error::{NimbusError, Result};

pub fn run() -> Result<()> {
    check_architecture()?;
    let missing = check_system_dependencies();
    check_kvm();

    if !missing.is_empty() {
        return Err(NimbusError::Config(format!(
            "missing required dependencies: {}",
            missing.join(", ")
        )));
    }

    tracing::info!("setup complete");
    Ok(())
}

fn check_architecture() -> Result<&'static str> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => return Err(NimbusError::Config(format!("unsupported architecture: {other}"))),
    };
    tracing::info!("[OK] architecture: {arch}");
    Ok(arch)
}

/// Same binaries `nimbus-network` shells out to for tap/bridge/NAT setup.
fn check_system_dependencies() -> Vec<&'static str> {
    let required = ["ip", "iptables", "iptables-save", "sysctl"];
    let missing: Vec<&str> = required
        .iter()
        .filter(|dep| which::which(dep).is_err())
        .copied()
        .collect();

    if missing.is_empty() {
        tracing::info!("[OK] all required system dependencies found");
    } else {
        tracing::warn!("missing required dependencies: {}", missing.join(", "));
    }
    missing
}

fn check_kvm() {
    use std::fs::File;

    match File::options().read(true).write(true).open("/dev/kvm") {
        Ok(_) => tracing::info!("[OK] KVM accessible"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("/dev/kvm not found — ensure bare-metal with KVM enabled");
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!("/dev/kvm not accessible — run: sudo chmod 666 /dev/kvm");
        }
        Err(e) => tracing::warn!("/dev/kvm check failed: {e}"),
    }
}
