// Shared builders for synthetic inventory snapshots.

use blocksmith::config::{Escalation, FstabFormat, Settings};
use blocksmith::inventory::InventorySnapshot;
use blocksmith::{BlockDevice, DeviceRole};
use chrono::Utc;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn device(path: &str, size: u64, role: DeviceRole) -> BlockDevice {
    BlockDevice {
        path: path.to_string(),
        name: path.trim_start_matches("/dev/").to_string(),
        model: Some("Fixture Disk".to_string()),
        serial: Some("FIXTURE001".to_string()),
        size,
        transport: Some("sata".to_string()),
        rotational: false,
        partition_table: None,
        role,
        partitions: Vec::new(),
    }
}

pub fn snapshot(devices: Vec<BlockDevice>) -> InventorySnapshot {
    InventorySnapshot {
        taken_at: Utc::now(),
        devices,
        arrays: Vec::new(),
    }
}

/// Settings that never shell out (no blkid lookups) and never escalate.
pub fn offline_settings() -> Settings {
    Settings {
        escalation: Escalation::None,
        fstab: FstabFormat {
            prefer_uuid: false,
            ..FstabFormat::default()
        },
        ..Settings::default()
    }
}
