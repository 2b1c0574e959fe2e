// Block device inventory.
//
// Organized structure:
// - lsblk.rs: typed model of `lsblk --json --bytes` output
// - claims.rs: registry of devices held by an executing plan
// - mod.rs: scan logic, role resolution, mdstat parsing, udev enrichment
//
// Every scan builds a fresh snapshot; nothing is cached between calls, so
// hotplugged devices appear and vanished ones disappear on the next scan.

pub mod claims;
pub mod lsblk;


pub use claims::{claim, is_claimed, ClaimGuard};

use crate::{BlockDevice, DeviceRole, Error, Partition, Result};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// An active md array as reported by `/proc/mdstat`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MdArray {
    /// Kernel name, e.g. `md0`
    pub name: String,
    /// Raid level token, e.g. `raid1`; absent for inactive arrays
    pub level: Option<String>,
    pub active: bool,
    /// Kernel names of member devices, e.g. `sdb`
    pub members: Vec<String>,
}

/// Immutable result of one inventory scan.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub taken_at: DateTime<Utc>,
    pub devices: Vec<BlockDevice>,
    pub arrays: Vec<MdArray>,
}

impl InventorySnapshot {
    /// Look up a device by node path.
    pub fn get(&self, path: &str) -> Option<&BlockDevice> {
        self.devices.iter().find(|d| d.path == path)
    }

    /// The array a device (by kernel name) is a member of, if any.
    pub fn array_containing(&self, kernel_name: &str) -> Option<&MdArray> {
        self.arrays
            .iter()
            .find(|a| a.members.iter().any(|m| m == kernel_name))
    }
}

pub struct Inventory;

impl Inventory {
    /// Enumerate block devices and resolve their current roles.
    ///
    /// Virtual devices (loop, ram, dm-, zram, CD/DVD) are skipped. Composite
    /// devices (md arrays, bcache devices) nested inside the lsblk tree are
    /// promoted to top-level entries so they can be targeted by format and
    /// fstab intents.
    pub fn scan() -> Result<InventorySnapshot> {
        let output = lsblk::query(None)?;
        let mdstat = read_mdstat();
        let arrays = parse_mdstat(&mdstat);

        let mut devices = Vec::new();

        for dev in &output.blockdevices {
            if should_skip_device(&dev.name) {
                continue;
            }

            if dev.kind == "disk" {
                devices.push(Self::build_device(dev, &arrays));
            }

            Self::collect_composites(dev, &mut devices);
        }

        Ok(InventorySnapshot {
            taken_at: Utc::now(),
            devices,
            arrays,
        })
    }

    fn build_device(dev: &lsblk::LsblkDevice, arrays: &[MdArray]) -> BlockDevice {
        let path = dev.node_path();
        let raid_member = arrays.iter().any(|a| a.members.iter().any(|m| *m == dev.name));
        let role = resolve_role(
            claims::is_claimed(&path),
            has_bcache_dir(&dev.name),
            dev.fstype.as_deref(),
            raid_member,
            dev.any_mounted(),
        );

        let mut device = BlockDevice {
            path,
            name: dev.name.clone(),
            model: dev.model.clone().filter(|m| !m.trim().is_empty()),
            serial: dev.serial.clone().filter(|s| !s.trim().is_empty()),
            size: dev.size,
            transport: dev.tran.clone(),
            rotational: dev.rota,
            partition_table: dev.pttype.clone(),
            role,
            partitions: dev
                .children
                .iter()
                .filter(|c| c.kind == "part")
                .map(|c| Partition {
                    name: c.name.clone(),
                    size: c.size,
                    fstype: c.fstype.clone(),
                    mountpoint: c.mountpoint.clone(),
                })
                .collect(),
        };

        // lsblk often lacks model/serial for NVMe behind some transports;
        // udev properties fill the gaps when available.
        if device.model.is_none() || device.serial.is_none() {
            if let Some(props) = udev_properties(&device.path) {
                if device.model.is_none() {
                    device.model = props.get("ID_MODEL").cloned();
                }
                if device.serial.is_none() {
                    device.serial = props.get("ID_SERIAL_SHORT").cloned();
                }
            }
        }

        device
    }

    /// Promote nested md / bcache composite devices to snapshot entries.
    fn collect_composites(dev: &lsblk::LsblkDevice, out: &mut Vec<BlockDevice>) {
        for child in &dev.children {
            if child.kind.starts_with("raid") || child.kind == "bcache" {
                let path = child.node_path();
                if !out.iter().any(|d| d.path == path) {
                    let role = if claims::is_claimed(&path) {
                        DeviceRole::Claimed
                    } else if child.any_mounted() {
                        DeviceRole::Mounted
                    } else {
                        DeviceRole::Free
                    };

                    out.push(BlockDevice {
                        path,
                        name: child.name.clone(),
                        model: None,
                        serial: None,
                        size: child.size,
                        transport: None,
                        rotational: dev.rota,
                        partition_table: child.pttype.clone(),
                        role,
                        partitions: Vec::new(),
                    });
                }
            }
            Self::collect_composites(child, out);
        }
    }
}

/// Skip loop devices, ram disks, device mapper, CD/DVD, zram.
pub(crate) fn should_skip_device(device_name: &str) -> bool {
    device_name.starts_with("loop")
        || device_name.starts_with("ram")
        || device_name.starts_with("dm-")
        || device_name.starts_with("sr")
        || device_name.starts_with("zram")
}

/// Resolve a device's role from independent observations.
///
/// Precedence: a claimed device is never reported free regardless of what
/// the filesystem probes say, and bcache/raid membership outranks a plain
/// mountpoint because it is the stronger constraint for planning.
pub(crate) fn resolve_role(
    claimed: bool,
    has_bcache_dir: bool,
    fstype: Option<&str>,
    raid_member: bool,
    mounted: bool,
) -> DeviceRole {
    if claimed {
        DeviceRole::Claimed
    } else if has_bcache_dir {
        DeviceRole::BcacheBacking
    } else if fstype == Some("bcache") {
        DeviceRole::BcacheCache
    } else if raid_member || fstype == Some("linux_raid_member") {
        DeviceRole::RaidMember
    } else if mounted {
        DeviceRole::Mounted
    } else {
        DeviceRole::Free
    }
}

/// A backing device attached to bcache exposes `/sys/block/<dev>/bcache`.
fn has_bcache_dir(device_name: &str) -> bool {
    Path::new("/sys/block")
        .join(device_name)
        .join("bcache")
        .exists()
}

fn read_mdstat() -> String {
    match fs::read_to_string("/proc/mdstat") {
        Ok(s) => s,
        Err(e) => {
            debug!("no mdstat available: {}", e);
            String::new()
        }
    }
}

lazy_static! {
    static ref MD_LINE: Regex =
        Regex::new(r"^(md\d+)\s*:\s*(active|inactive)\s*(?:\([^)]*\)\s*)?(raid\d+|linear|multipath)?")
            .expect("md line regex");
    static ref MD_MEMBER: Regex = Regex::new(r"([A-Za-z0-9]+)\[\d+\]").expect("md member regex");
}

/// Parse `/proc/mdstat` contents into array records.
pub fn parse_mdstat(contents: &str) -> Vec<MdArray> {
    let mut arrays = Vec::new();

    for line in contents.lines() {
        let Some(caps) = MD_LINE.captures(line) else {
            continue;
        };

        let members = MD_MEMBER
            .captures_iter(line)
            .map(|c| c[1].to_string())
            .collect();

        arrays.push(MdArray {
            name: caps[1].to_string(),
            level: caps.get(3).map(|m| m.as_str().to_string()),
            active: &caps[2] == "active",
            members,
        });
    }

    arrays
}

/// Query `udevadm info --query=property` for a device. Best-effort: any
/// failure yields `None` and the scan continues with lsblk data alone.
fn udev_properties(device_path: &str) -> Option<HashMap<String, String>> {
    let output = Command::new("udevadm")
        .args(["info", "--query=property", "--name", device_path])
        .output()
        .map_err(|e| {
            debug!(device = device_path, "udevadm unavailable: {}", e);
            e
        })
        .ok()?;

    if !output.status.success() {
        warn!(
            device = device_path,
            "udevadm info failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut props = HashMap::new();
    for line in stdout.lines() {
        // Property lines are prefixed with "E: "; some versions omit it
        let line = line.strip_prefix("E: ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            if key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
                props.insert(key.to_string(), value.to_string());
            }
        }
    }

    Some(props)
}

/// Probe whether a required external tool is on PATH.
pub fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .map(|o| o.status.success() || !o.stdout.is_empty() || !o.stderr.is_empty())
        .unwrap_or(false)
}

/// Require a tool, mapping absence to the taxonomy error.
pub fn require_tool(tool: &str) -> Result<()> {
    if tool_available(tool) {
        Ok(())
    } else {
        Err(Error::ToolMissing(tool.to_string()))
    }
}
