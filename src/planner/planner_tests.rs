// Planner validation and step-mapping tests against synthetic snapshots.

use super::*;
use crate::config::{FstabFormat, Settings};
use crate::inventory::{InventorySnapshot, MdArray};
use crate::{BlockDevice, DeviceRole, Partition};
use chrono::Utc;
use test_case::test_case;

const GIB: u64 = 1024 * 1024 * 1024;

fn device(path: &str, size: u64, role: DeviceRole) -> BlockDevice {
    let name = path.trim_start_matches("/dev/").to_string();
    BlockDevice {
        path: path.to_string(),
        name,
        model: Some("Test Disk".to_string()),
        serial: Some("TEST123".to_string()),
        size,
        transport: Some("sata".to_string()),
        rotational: false,
        partition_table: None,
        role,
        partitions: Vec::new(),
    }
}

fn snapshot(devices: Vec<BlockDevice>) -> InventorySnapshot {
    InventorySnapshot {
        taken_at: Utc::now(),
        devices,
        arrays: Vec::new(),
    }
}

fn planner() -> Planner {
    // prefer_uuid off so fstab planning never shells out to blkid
    Planner::new(Settings {
        fstab: FstabFormat {
            prefer_uuid: false,
            ..FstabFormat::default()
        },
        ..Settings::default()
    })
}

fn two_free_disks() -> InventorySnapshot {
    snapshot(vec![
        device("/dev/sdb", 4000 * GIB, DeviceRole::Free),
        device("/dev/sdc", 4000 * GIB, DeviceRole::Free),
    ])
}

fn raid1_intent() -> OperationIntent {
    OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
        array_name: "md0".to_string(),
    }
}

#[test]
fn raid1_step_ordering_is_zero_superblock_then_create() {
    let plan = planner().plan(&raid1_intent(), &two_free_disks()).unwrap();

    assert_eq!(plan.state(), PlanState::Validated);
    assert!(plan.warnings.is_empty());
    assert_eq!(plan.steps.len(), 3);

    assert_eq!(plan.steps[0].program, "mdadm");
    assert_eq!(plan.steps[0].args, vec!["--zero-superblock", "/dev/sdb"]);
    assert_eq!(plan.steps[1].args, vec!["--zero-superblock", "/dev/sdc"]);

    assert_eq!(plan.steps[2].program, "mdadm");
    assert_eq!(
        plan.steps[2].args,
        vec![
            "--create",
            "/dev/md0",
            "--level=1",
            "--raid-devices=2",
            "/dev/sdb",
            "/dev/sdc"
        ]
    );

    assert!(plan.steps.iter().all(|s| s.destructive));
    assert!(plan.is_destructive());
    assert!(plan.targets.contains(&"/dev/md0".to_string()));
    assert!(plan.targets.contains(&"/dev/sdb".to_string()));
}

#[test]
fn raid1_size_mismatch_warns_instead_of_truncating() {
    let snap = snapshot(vec![
        device("/dev/sdb", 4000 * GIB, DeviceRole::Free),
        device("/dev/sdc", 2000 * GIB, DeviceRole::Free),
    ]);

    let plan = planner().plan(&raid1_intent(), &snap).unwrap();

    assert_eq!(plan.warnings.len(), 1);
    assert!(plan.warnings[0].contains("/dev/sdc"), "{}", plan.warnings[0]);
    assert!(plan.warnings[0].contains("smallest"));
    // The steps themselves are unchanged by the mismatch
    assert_eq!(plan.steps.len(), 3);
}

#[test]
fn raid0_size_mismatch_is_not_warned() {
    let snap = snapshot(vec![
        device("/dev/sdb", 4000 * GIB, DeviceRole::Free),
        device("/dev/sdc", 2000 * GIB, DeviceRole::Free),
    ]);
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid0,
        members: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
        array_name: "md0".to_string(),
    };

    let plan = planner().plan(&intent, &snap).unwrap();
    assert!(plan.warnings.is_empty());
    assert!(plan.steps[2].args.contains(&"--level=0".to_string()));
}

#[test]
fn raid_requires_two_members() {
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string()],
        array_name: "md0".to_string(),
    };
    let err = planner().plan(&intent, &two_free_disks()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn raid_requires_distinct_members() {
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string(), "/dev/sdb".to_string()],
        array_name: "md0".to_string(),
    };
    let err = planner().plan(&intent, &two_free_disks()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn raid_rejects_unknown_member() {
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string(), "/dev/sdz".to_string()],
        array_name: "md0".to_string(),
    };
    let err = planner().plan(&intent, &two_free_disks()).unwrap_err();
    assert!(err.to_string().contains("/dev/sdz"));
}

#[test_case(DeviceRole::Mounted; "mounted")]
#[test_case(DeviceRole::RaidMember; "raid member")]
#[test_case(DeviceRole::BcacheBacking; "bcache backing")]
#[test_case(DeviceRole::BcacheCache; "bcache cache")]
#[test_case(DeviceRole::Claimed; "claimed")]
fn raid_rejects_busy_member(role: DeviceRole) {
    let snap = snapshot(vec![
        device("/dev/sdb", 4000 * GIB, DeviceRole::Free),
        device("/dev/sdc", 4000 * GIB, role),
    ]);
    let err = planner().plan(&raid1_intent(), &snap).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn raid_rejects_bad_array_name() {
    let intent = OperationIntent::CreateRaid {
        level: RaidLevel::Raid1,
        members: vec!["/dev/sdb".to_string(), "/dev/sdc".to_string()],
        array_name: "../md0".to_string(),
    };
    let err = planner().plan(&intent, &two_free_disks()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn bcache_steps_wipe_both_then_attach() {
    let intent = OperationIntent::CreateBcache {
        backing: "/dev/sdb".to_string(),
        caching: "/dev/sdc".to_string(),
    };
    let plan = planner().plan(&intent, &two_free_disks()).unwrap();

    assert_eq!(plan.steps.len(), 3);
    assert_eq!(plan.steps[0].program, "wipefs");
    assert_eq!(plan.steps[0].args, vec!["-a", "/dev/sdb"]);
    assert_eq!(plan.steps[1].args, vec!["-a", "/dev/sdc"]);
    assert_eq!(plan.steps[2].program, "make-bcache");
    assert_eq!(plan.steps[2].args, vec!["-B", "/dev/sdb", "-C", "/dev/sdc"]);
    assert!(plan.steps.iter().all(|s| s.destructive));
}

#[test]
fn bcache_requires_distinct_devices() {
    let intent = OperationIntent::CreateBcache {
        backing: "/dev/sdb".to_string(),
        caching: "/dev/sdb".to_string(),
    };
    let err = planner().plan(&intent, &two_free_disks()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test_case(DeviceRole::BcacheBacking; "already backing")]
#[test_case(DeviceRole::BcacheCache; "already cache")]
fn bcache_rejects_devices_already_in_a_set(role: DeviceRole) {
    let snap = snapshot(vec![
        device("/dev/sdb", 4000 * GIB, role),
        device("/dev/sdc", 4000 * GIB, DeviceRole::Free),
    ]);
    let intent = OperationIntent::CreateBcache {
        backing: "/dev/sdb".to_string(),
        caching: "/dev/sdc".to_string(),
    };
    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(err.to_string().contains("bcache"));
}

#[test]
fn wipe_mounted_device_is_rejected_without_teardown() {
    let snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::Mounted)]);
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: false,
    };

    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("mounted"));
}

#[test]
fn wipe_mounted_with_teardown_unmounts_partitions_first() {
    let mut dev = device("/dev/sdb", 4000 * GIB, DeviceRole::Mounted);
    dev.partitions = vec![
        Partition {
            name: "sdb1".to_string(),
            size: 2000 * GIB,
            fstype: Some("ext4".to_string()),
            mountpoint: Some("/mnt/data".to_string()),
        },
        Partition {
            name: "sdb2".to_string(),
            size: 2000 * GIB,
            fstype: Some("ext4".to_string()),
            mountpoint: None,
        },
    ];
    let snap = snapshot(vec![dev]);
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: true,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps[0].program, "umount");
    assert_eq!(plan.steps[0].args, vec!["/dev/sdb1"]);
    // sdb2 is not mounted, so only one umount step
    assert_eq!(
        plan.steps.iter().filter(|s| s.program == "umount").count(),
        1
    );
    let last = plan.steps.last().unwrap();
    assert_eq!(last.args, vec!["-a", "/dev/sdb"]);
}

#[test]
fn wipe_free_device_lists_signatures_before_erasing() {
    let snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: false,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps.len(), 2);
    let listing = &plan.steps[0];
    assert!(!listing.destructive, "signature listing is informational");
    assert!(listing.continue_on_error);
    assert_eq!(listing.args, vec!["/dev/sdb"]);

    let erase = &plan.steps[1];
    assert!(erase.destructive);
    assert_eq!(erase.args, vec!["-a", "/dev/sdb"]);
}

#[test]
fn wipe_raid_member_with_teardown_stops_the_array() {
    let mut snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::RaidMember)]);
    snap.arrays = vec![MdArray {
        name: "md0".to_string(),
        level: Some("raid1".to_string()),
        active: true,
        members: vec!["sdb".to_string(), "sdc".to_string()],
    }];
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: true,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps[0].program, "mdadm");
    assert_eq!(plan.steps[0].args, vec!["--stop", "/dev/md0"]);
}

#[test]
fn wipe_raid_member_without_identifiable_array_is_rejected() {
    let snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::RaidMember)]);
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: true,
    };
    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn wipe_claimed_device_is_rejected_even_with_teardown() {
    let snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::Claimed)]);
    let intent = OperationIntent::Wipe {
        device: "/dev/sdb".to_string(),
        force_teardown: true,
    };
    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(err.to_string().contains("another running plan"));
}

#[test]
fn format_with_label_uses_mkfs_label_flag() {
    let snap = snapshot(vec![device("/dev/sdb", 4000 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::Format {
        device: "/dev/sdb".to_string(),
        filesystem: "ext4".to_string(),
        label: Some("archive".to_string()),
        force_teardown: false,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].program, "mkfs.ext4");
    assert_eq!(plan.steps[0].args, vec!["-L", "archive", "/dev/sdb"]);
    assert!(plan.steps[0].destructive);
}

#[test]
fn format_label_on_vfat_is_dropped_with_warning() {
    let snap = snapshot(vec![device("/dev/sdb", 64 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::Format {
        device: "/dev/sdb".to_string(),
        filesystem: "vfat".to_string(),
        label: Some("stick".to_string()),
        force_teardown: false,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps[0].program, "mkfs.vfat");
    assert_eq!(plan.steps[0].args, vec!["/dev/sdb"]);
    assert_eq!(plan.warnings.len(), 1);
}

#[test]
fn format_rejects_shell_metacharacters_in_filesystem() {
    let snap = snapshot(vec![device("/dev/sdb", 64 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::Format {
        device: "/dev/sdb".to_string(),
        filesystem: "ext4; rm -rf /".to_string(),
        label: None,
        force_teardown: false,
    };
    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn fstab_plan_creates_mountpoint_appends_and_mounts() {
    let snap = snapshot(vec![device("/dev/md0", 8000 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::AddFstabEntry {
        device: "/dev/md0".to_string(),
        mountpoint: "/mnt/raid".to_string(),
        filesystem: "ext4".to_string(),
        options: None,
    };

    let plan = planner().plan(&intent, &snap).unwrap();

    assert_eq!(plan.steps.len(), 3);
    assert_eq!(plan.steps[0].program, "mkdir");
    assert_eq!(plan.steps[0].args, vec!["-p", "/mnt/raid"]);

    assert_eq!(plan.steps[1].program, "sh");
    let script = &plan.steps[1].args[1];
    assert!(script.contains("grep -Eq"), "append must be guarded: {}", script);
    assert!(script.contains("/dev/md0"));
    assert!(script.contains("defaults"), "default options expected");

    assert_eq!(plan.steps[2].program, "mount");
    assert_eq!(plan.steps[2].args, vec!["-a"]);
    assert!(plan.is_destructive());
}

#[test_case("relative/path"; "relative")]
#[test_case("/mnt/with space"; "whitespace")]
#[test_case("/mnt/it's"; "quote")]
fn fstab_rejects_bad_mountpoints(mountpoint: &str) {
    let snap = snapshot(vec![device("/dev/md0", 8000 * GIB, DeviceRole::Free)]);
    let intent = OperationIntent::AddFstabEntry {
        device: "/dev/md0".to_string(),
        mountpoint: mountpoint.to_string(),
        filesystem: "ext4".to_string(),
        options: None,
    };
    let err = planner().plan(&intent, &snap).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn confirmation_lifecycle() {
    let mut plan = planner().plan(&raid1_intent(), &two_free_disks()).unwrap();

    assert_eq!(plan.state(), PlanState::Validated);
    plan.begin_confirmation().unwrap();
    assert_eq!(plan.state(), PlanState::ConfirmationPending);

    // Cannot re-enter confirmation
    assert!(plan.begin_confirmation().is_err());
}

#[test]
fn non_destructive_plan_refuses_confirmation() {
    // A plan with no steps marked destructive has nothing to confirm;
    // fabricate one via the test constructor.
    let mut plan = test_plan("noop", Vec::new(), Vec::new());
    assert!(!plan.is_destructive());
    assert!(plan.begin_confirmation().is_err());
}
