// Allow uppercase acronyms for industry-standard terms like RAID, UUID, SMART
#![allow(clippy::upper_case_acronyms)]

pub mod config;
pub mod executor;
pub mod fstab;
pub mod health;
pub mod inventory;
pub mod planner;
pub mod reporter;

// Re-export the main orchestration entry points for convenience
pub use executor::{ConfirmationToken, ExecutionResult, PlanOutcome, PrivilegedExecutor};
pub use inventory::{Inventory, InventorySnapshot};
pub use planner::{OperationIntent, Plan, Planner, Step};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// Global flag for handling Ctrl+C interrupts
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by signal handler)
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Error taxonomy for the orchestration core.
///
/// Probe failures are recoverable (callers surface "unknown" state);
/// validation and confirmation failures happen before any privileged
/// command runs; execution failures abort the remaining steps of a plan.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("required tool '{0}' not found in PATH")]
    ToolMissing(String),

    #[error("device {0} has no accessible health interface")]
    UnsupportedDevice(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("plan {0} contains destructive steps but no matching confirmation was given")]
    ConfirmationMissing(uuid::Uuid),

    #[error("failed to run step {index} ({command}): {source}")]
    Execution {
        index: usize,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation interrupted by user")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A block device as reported by a single inventory scan.
///
/// Snapshots are rebuilt per query and never cached; the device may be gone
/// by the time the caller acts on it, which is why the planner re-validates
/// against the snapshot it was handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device node path, e.g. `/dev/sda`
    pub path: String,
    /// Kernel name, e.g. `sda`
    pub name: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Bus transport, e.g. `sata`, `nvme`, `usb`
    pub transport: Option<String>,
    pub rotational: bool,
    /// Partition table type, e.g. `gpt`, `dos`
    pub partition_table: Option<String>,
    pub role: DeviceRole,
    pub partitions: Vec<Partition>,
}

impl BlockDevice {
    /// True when the device can be consumed by a new RAID or bcache plan.
    pub fn is_free(&self) -> bool {
        self.role == DeviceRole::Free
    }
}

/// Current role of a device, derived from mountpoints, `/proc/mdstat`,
/// the bcache sysfs tree, and the claim registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Free,
    /// The device or one of its partitions is mounted
    Mounted,
    RaidMember,
    BcacheBacking,
    BcacheCache,
    /// Held by a plan that is currently executing
    Claimed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub size: u64,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
}

/// Render a byte count the way disk tools label drives (binary units).
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Overall SMART verdict for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    Passed,
    Failed,
    /// SMART unavailable or unparseable; never treated as an error
    Unknown,
}
