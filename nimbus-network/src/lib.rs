//! Network Allocator (component A): tap devices, /30 subnets, and per-VM MAC
//! addresses for Firecracker guests, plus the host-side NAT/forwarding rules
//! that let guest traffic reach the outside world.
//!
//! Every guest is fresh-booted with the same fixed kernel `ip=` boot arg
//! (guest IP, gateway IP, netmask all constant — see `configure_and_start` in
//! `nimbus-vm`), and a snapshot restore never re-applies boot args, so a
//! restored guest's in-kernel network state always expects that same fixed
//! gateway. The tap's host-facing address therefore has to be that same fixed
//! gateway address too — point-to-point, one `/30`, both ends constant — or
//! the guest's ARP requests for its gateway go unanswered. The per-VM bitmap
//! slot no longer numbers the tap's address; it only bounds how many VMs can
//! run concurrently and gives each VM's iptables rules a unique comment tag
//! for idempotent teardown. Concurrent VMs sharing one fixed gateway address
//! across distinct host-side tap devices (rather than isolated network
//! namespaces, as the teacher's pool does) means host-initiated traffic
//! addressed directly to a guest's IP is ambiguous when more than one VM is
//! up — acceptable here because the host only ever talks to a guest over
//! vsock, never over this tap network (see `DESIGN.md`).

mod command;
mod error;

use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::{info, warn};
use uuid::Uuid;

pub use error::{NetworkError, Result};

use command::{Privilege, exec, exec_ignore_errors};

/// Guest-facing config shared by every VM (see module docs for why this is
/// fixed). `/30` gives the guest one usable host route (its gateway).
const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 100, 2);
const GUEST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);
/// The host side of that same `/30` — assigned directly to every tap device
/// so the guest's gateway ARP resolves, regardless of which bitmap slot the
/// VM happens to hold.
const TAP_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 100, 1);

/// Networking handed to the VM Manager for one VM. 1:1 with a live `vm_id`
/// while the VM is not `Stopped` (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub tap_name: String,
    pub mac: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Configuration for the allocator's bitmap pool. `base` must be the network
/// address of a `/16` (e.g. `10.200.0.0`); the pool carves it into `/30`s.
#[derive(Debug, Clone)]
pub struct NetworkAllocatorConfig {
    pub bridge_pool_base: Ipv4Addr,
    pub uplink_iface: String,
}

impl Default for NetworkAllocatorConfig {
    fn default() -> Self {
        Self {
            bridge_pool_base: Ipv4Addr::new(10, 200, 0, 0),
            uplink_iface: "eth0".into(),
        }
    }
}

/// Number of `/30` slots carved out of the configured `/16` pool
/// (`2^16 / 4 = 16384`).
const MAX_SLOTS: u32 = 1 << 14;

struct Slots {
    /// `true` = in use.
    used: Vec<bool>,
}

/// Allocates and releases per-VM networking. One instance is shared by the
/// VM Manager across all create/restore/destroy calls.
pub struct NetworkAllocator {
    config: NetworkAllocatorConfig,
    slots: Mutex<Slots>,
    /// `vm_id -> slot index`, needed so `cleanup` can release the right slot
    /// without the caller having to remember it.
    assignments: Mutex<std::collections::HashMap<Uuid, u32>>,
}

impl NetworkAllocator {
    pub fn new(config: NetworkAllocatorConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Slots {
                used: vec![false; MAX_SLOTS as usize],
            }),
            assignments: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Picks an unused `/30`, creates and configures a tap device for
    /// `vm_id`, and installs NAT so guest traffic exits via `uplink_iface`.
    pub async fn setup(&self, vm_id: Uuid) -> Result<NetworkConfig> {
        let slot = self.reserve_slot()?;
        let host_ip = host_ip_for_slot(self.config.bridge_pool_base, slot);
        let tap_name = tap_name_for(vm_id);
        let mac = mac_for(vm_id);

        if let Err(e) = self.create_tap(&tap_name).await {
            self.release_slot(slot);
            return Err(e);
        }
        if let Err(e) = self.install_nat(&tap_name).await {
            self.teardown_tap(&tap_name).await;
            self.release_slot(slot);
            return Err(e);
        }

        self.assignments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(vm_id, slot);

        info!(%vm_id, tap = %tap_name, %host_ip, "network allocated");
        Ok(NetworkConfig {
            tap_name,
            mac,
            host_ip,
            guest_ip: GUEST_IP,
            netmask: GUEST_NETMASK,
        })
    }

    /// Idempotent: safe to call on a `vm_id` whose setup never completed, or
    /// whose network was already torn down.
    pub async fn cleanup(&self, vm_id: Uuid) {
        let tap_name = tap_name_for(vm_id);
        self.remove_nat(&tap_name).await;
        self.teardown_tap(&tap_name).await;

        let slot = self
            .assignments
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&vm_id);
        if let Some(slot) = slot {
            self.release_slot(slot);
        }
    }

    fn reserve_slot(&self) -> Result<u32> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        match slots.used.iter().position(|&used| !used) {
            Some(idx) => {
                if let Some(slot) = slots.used.get_mut(idx) {
                    *slot = true;
                }
                Ok(idx as u32)
            }
            None => Err(NetworkError::NetExhausted),
        }
    }

    fn release_slot(&self, slot: u32) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(used) = slots.used.get_mut(slot as usize) {
            *used = false;
        }
    }

    async fn create_tap(&self, tap_name: &str) -> Result<()> {
        exec("ip", &["tuntap", "add", tap_name, "mode", "tap"], Privilege::Sudo).await?;
        let addr = format!("{TAP_GATEWAY_IP}/30");
        exec("ip", &["addr", "add", &addr, "dev", tap_name], Privilege::Sudo).await?;
        exec("ip", &["link", "set", tap_name, "up"], Privilege::Sudo).await?;
        Ok(())
    }

    async fn teardown_tap(&self, tap_name: &str) {
        exec_ignore_errors("ip", &["link", "del", tap_name], Privilege::Sudo).await;
    }

    async fn install_nat(&self, tap_name: &str) -> Result<()> {
        exec(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-o",
                &self.config.uplink_iface,
                "-j",
                "MASQUERADE",
                "-m",
                "comment",
                "--comment",
                tap_name,
            ],
            Privilege::Sudo,
        )
        .await?;
        exec(
            "iptables",
            &[
                "-A",
                "FORWARD",
                "-i",
                tap_name,
                "-o",
                &self.config.uplink_iface,
                "-j",
                "ACCEPT",
                "-m",
                "comment",
                "--comment",
                tap_name,
            ],
            Privilege::Sudo,
        )
        .await?;
        exec(
            "iptables",
            &[
                "-A",
                "FORWARD",
                "-i",
                &self.config.uplink_iface,
                "-o",
                tap_name,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
                "-m",
                "comment",
                "--comment",
                tap_name,
            ],
            Privilege::Sudo,
        )
        .await?;
        Ok(())
    }

    async fn remove_nat(&self, tap_name: &str) {
        for table in ["nat", "filter"] {
            let rules = match exec(
                "sh",
                &[
                    "-c",
                    &format!("iptables-save -t {table} | grep -F -- {tap_name} || true"),
                ],
                Privilege::Sudo,
            )
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(table, tap = %tap_name, error = %e, "could not read iptables rules for cleanup");
                    continue;
                }
            };
            for line in rules.lines().filter(|l| l.starts_with("-A ")) {
                let rule = line.replacen("-A ", "-D ", 1);
                let mut args: Vec<&str> = vec!["-t", table];
                args.extend(rule.split_whitespace());
                exec_ignore_errors("iptables", &args, Privilege::Sudo).await;
            }
        }
    }
}

fn tap_name_for(vm_id: Uuid) -> String {
    let short = vm_id.simple().to_string();
    format!("nbm-{}", short.get(..11).unwrap_or(&short))
}

/// Derive a locally-administered, unicast MAC from `vm_id`'s bytes. Setting
/// the second-lowest bit of the first octet marks it locally administered;
/// clearing the lowest bit marks it unicast, per IEEE 802.
fn mac_for(vm_id: Uuid) -> String {
    let bytes = vm_id.as_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(bytes.get(..6).unwrap_or(&[0u8; 6]));
    mac[0] = (mac[0] & 0xfc) | 0x02;
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn host_ip_for_slot(base: Ipv4Addr, slot: u32) -> Ipv4Addr {
    let base_u32 = u32::from(base);
    Ipv4Addr::from(base_u32 + slot * 4 + 1)
}
