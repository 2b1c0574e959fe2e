// Operation planning.
//
// The planner turns a user intent plus an inventory snapshot into an
// ordered, validated sequence of external commands. Ordering is a static
// property of the intent-to-steps mapping below, never discovered at run
// time: md superblocks are cleared before `mdadm --create`, bcache
// superblocks are wiped before `make-bcache`, unmount/teardown always
// precedes destruction of the data underneath.

#[cfg(test)]
mod planner_tests;

use crate::config::Settings;
use crate::fstab::{self, FstabEntry};
use crate::inventory::InventorySnapshot;
use crate::{human_size, BlockDevice, DeviceRole, Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidLevel {
    Raid0,
    Raid1,
}

impl RaidLevel {
    pub fn mdadm_arg(&self) -> &'static str {
        match self {
            RaidLevel::Raid0 => "0",
            RaidLevel::Raid1 => "1",
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaidLevel::Raid0 => write!(f, "RAID0"),
            RaidLevel::Raid1 => write!(f, "RAID1"),
        }
    }
}

/// A user-declared goal, validated before it becomes a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationIntent {
    CreateBcache {
        backing: String,
        caching: String,
    },
    CreateRaid {
        level: RaidLevel,
        members: Vec<String>,
        array_name: String,
    },
    Wipe {
        device: String,
        /// Include unmount/teardown sub-steps instead of rejecting a busy device
        force_teardown: bool,
    },
    Format {
        device: String,
        filesystem: String,
        label: Option<String>,
        force_teardown: bool,
    },
    AddFstabEntry {
        device: String,
        mountpoint: String,
        filesystem: String,
        options: Option<String>,
    },
}

impl OperationIntent {
    pub fn describe(&self) -> String {
        match self {
            OperationIntent::CreateBcache { backing, caching } => {
                format!("Create bcache device ({} backed, {} cache)", backing, caching)
            }
            OperationIntent::CreateRaid {
                level,
                members,
                array_name,
            } => format!(
                "Create {} array /dev/{} from {} devices",
                level,
                array_name,
                members.len()
            ),
            OperationIntent::Wipe { device, .. } => {
                format!("Wipe all signatures from {}", device)
            }
            OperationIntent::Format {
                device, filesystem, ..
            } => format!("Format {} as {}", device, filesystem),
            OperationIntent::AddFstabEntry {
                device, mountpoint, ..
            } => format!("Add fstab entry mounting {} at {}", device, mountpoint),
        }
    }
}

/// One external-command invocation inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
    pub description: String,
    /// Requires explicit confirmation; once confirmed it cannot be skipped
    pub destructive: bool,
    /// Failure does not abort the remaining steps
    pub continue_on_error: bool,
    /// Overrides the executor's default per-step timeout
    pub timeout: Option<Duration>,
}

impl Step {
    fn new(program: &str, args: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            description: description.into(),
            destructive: false,
            continue_on_error: false,
            timeout: None,
        }
    }

    fn destructive(program: &str, args: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            destructive: true,
            ..Self::new(program, args, description)
        }
    }

    fn best_effort(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Rendered command line, for display and audit logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Plan lifecycle. Terminal states are `Completed`, `FailedAtStep`, and
/// `Aborted`; nothing ever re-enters `Drafted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Drafted,
    Validated,
    ConfirmationPending,
    Confirmed,
    Executing,
    Completed,
    FailedAtStep(usize),
    Aborted,
}

/// An ordered, validated sequence of steps against a fixed target set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub description: String,
    pub steps: Vec<Step>,
    /// Non-fatal findings, e.g. a RAID1 size mismatch
    pub warnings: Vec<String>,
    /// Device paths the executor claims for the duration of the run
    pub targets: Vec<String>,
    state: PlanState,
}

impl Plan {
    fn draft(description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            description,
            steps: Vec::new(),
            warnings: Vec::new(),
            targets: Vec::new(),
            state: PlanState::Drafted,
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn is_destructive(&self) -> bool {
        self.steps.iter().any(|s| s.destructive)
    }

    /// Move a validated destructive plan into `ConfirmationPending` while
    /// the caller collects the user's decision.
    pub fn begin_confirmation(&mut self) -> Result<()> {
        if !self.is_destructive() {
            return Err(Error::Validation(
                "plan has no destructive steps; no confirmation needed".to_string(),
            ));
        }
        if self.state != PlanState::Validated {
            return Err(Error::Validation(format!(
                "plan in state {:?} cannot await confirmation",
                self.state
            )));
        }
        self.state = PlanState::ConfirmationPending;
        Ok(())
    }

    pub(crate) fn mark_validated(&mut self) {
        debug_assert_eq!(self.state, PlanState::Drafted);
        self.state = PlanState::Validated;
    }

    pub(crate) fn mark_confirmed(&mut self) {
        self.state = PlanState::Confirmed;
    }

    pub(crate) fn mark_executing(&mut self) {
        self.state = PlanState::Executing;
    }

    pub(crate) fn mark_terminal(&mut self, state: PlanState) {
        debug_assert!(matches!(
            state,
            PlanState::Completed | PlanState::FailedAtStep(_) | PlanState::Aborted
        ));
        self.state = state;
    }
}

/// Build an already-validated plan from raw steps. Test-only: production
/// plans always come out of `Planner::plan`.
#[cfg(test)]
pub(crate) fn test_plan(description: &str, steps: Vec<Step>, targets: Vec<String>) -> Plan {
    let mut plan = Plan::draft(description.to_string());
    plan.steps = steps;
    plan.targets = targets;
    plan.mark_validated();
    plan
}

pub struct Planner {
    settings: Settings,
}

impl Planner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Validate an intent against the snapshot and emit a plan.
    ///
    /// Validation happens before any step is constructed; a plan is only
    /// ever returned in the `Validated` state.
    pub fn plan(&self, intent: &OperationIntent, snapshot: &InventorySnapshot) -> Result<Plan> {
        let mut plan = Plan::draft(intent.describe());

        match intent {
            OperationIntent::CreateRaid {
                level,
                members,
                array_name,
            } => self.plan_raid(&mut plan, snapshot, *level, members, array_name)?,
            OperationIntent::CreateBcache { backing, caching } => {
                self.plan_bcache(&mut plan, snapshot, backing, caching)?
            }
            OperationIntent::Wipe {
                device,
                force_teardown,
            } => self.plan_wipe(&mut plan, snapshot, device, *force_teardown)?,
            OperationIntent::Format {
                device,
                filesystem,
                label,
                force_teardown,
            } => self.plan_format(
                &mut plan,
                snapshot,
                device,
                filesystem,
                label.as_deref(),
                *force_teardown,
            )?,
            OperationIntent::AddFstabEntry {
                device,
                mountpoint,
                filesystem,
                options,
            } => self.plan_fstab_entry(
                &mut plan,
                snapshot,
                device,
                mountpoint,
                filesystem,
                options.as_deref(),
            )?,
        }

        plan.mark_validated();
        Ok(plan)
    }

    fn plan_raid(
        &self,
        plan: &mut Plan,
        snapshot: &InventorySnapshot,
        level: RaidLevel,
        members: &[String],
        array_name: &str,
    ) -> Result<()> {
        validate_array_name(array_name)?;

        if members.len() < 2 {
            return Err(Error::Validation(format!(
                "RAID creation requires at least 2 member devices, got {}",
                members.len()
            )));
        }

        let distinct: HashSet<&String> = members.iter().collect();
        if distinct.len() != members.len() {
            return Err(Error::Validation(
                "RAID member devices must be distinct".to_string(),
            ));
        }

        let mut devices = Vec::new();
        for path in members {
            let dev = lookup(snapshot, path)?;
            ensure_free(dev)?;
            devices.push(dev);
        }

        if level == RaidLevel::Raid1 {
            let smallest = devices.iter().min_by_key(|d| d.size).expect("≥2 members");
            let largest = devices.iter().max_by_key(|d| d.size).expect("≥2 members");
            if smallest.size != largest.size {
                plan.warnings.push(format!(
                    "RAID1 members differ in size; usable capacity is bounded by the \
                     smallest member {} ({})",
                    smallest.path,
                    human_size(smallest.size)
                ));
            }
        }

        for path in members {
            plan.steps.push(Step::destructive(
                "mdadm",
                vec!["--zero-superblock".to_string(), path.clone()],
                format!("Clear any old md superblock on {}", path),
            ));
        }

        let mut create_args = vec![
            "--create".to_string(),
            format!("/dev/{}", array_name),
            format!("--level={}", level.mdadm_arg()),
            format!("--raid-devices={}", members.len()),
        ];
        create_args.extend(members.iter().cloned());
        plan.steps.push(Step::destructive(
            "mdadm",
            create_args,
            format!("Create {} array /dev/{}", level, array_name),
        ));

        plan.targets = members.to_vec();
        plan.targets.push(format!("/dev/{}", array_name));
        Ok(())
    }

    fn plan_bcache(
        &self,
        plan: &mut Plan,
        snapshot: &InventorySnapshot,
        backing: &str,
        caching: &str,
    ) -> Result<()> {
        if backing == caching {
            return Err(Error::Validation(
                "bcache backing and caching devices must be distinct".to_string(),
            ));
        }

        for path in [backing, caching] {
            let dev = lookup(snapshot, path)?;
            match dev.role {
                DeviceRole::BcacheBacking | DeviceRole::BcacheCache => {
                    return Err(Error::Validation(format!(
                        "{} is already part of an active bcache set; detach it first",
                        path
                    )));
                }
                _ => ensure_free(dev)?,
            }
        }

        plan.steps.push(Step::destructive(
            "wipefs",
            vec!["-a".to_string(), backing.to_string()],
            format!("Erase old signatures on backing device {}", backing),
        ));
        plan.steps.push(Step::destructive(
            "wipefs",
            vec!["-a".to_string(), caching.to_string()],
            format!("Erase old signatures on cache device {}", caching),
        ));
        plan.steps.push(Step::destructive(
            "make-bcache",
            vec![
                "-B".to_string(),
                backing.to_string(),
                "-C".to_string(),
                caching.to_string(),
            ],
            format!("Create bcache device over {} cached by {}", backing, caching),
        ));

        plan.targets = vec![backing.to_string(), caching.to_string()];
        Ok(())
    }

    fn plan_wipe(
        &self,
        plan: &mut Plan,
        snapshot: &InventorySnapshot,
        device: &str,
        force_teardown: bool,
    ) -> Result<()> {
        let dev = lookup(snapshot, device)?;
        let teardown = teardown_steps(dev, snapshot, force_teardown)?;

        plan.steps.extend(teardown);
        plan.steps.push(
            Step::new(
                "wipefs",
                vec![device.to_string()],
                format!("List current filesystem signatures on {}", device),
            )
            .best_effort(),
        );
        plan.steps.push(Step::destructive(
            "wipefs",
            vec!["-a".to_string(), device.to_string()],
            format!("Erase all filesystem signatures on {}", device),
        ));

        plan.targets = vec![device.to_string()];
        Ok(())
    }

    fn plan_format(
        &self,
        plan: &mut Plan,
        snapshot: &InventorySnapshot,
        device: &str,
        filesystem: &str,
        label: Option<&str>,
        force_teardown: bool,
    ) -> Result<()> {
        validate_filesystem(filesystem)?;

        let dev = lookup(snapshot, device)?;
        plan.steps.extend(teardown_steps(dev, snapshot, force_teardown)?);

        let mut args = Vec::new();
        match label {
            Some(l) if matches!(filesystem, "ext4" | "xfs" | "btrfs") => {
                validate_label(l)?;
                args.push("-L".to_string());
                args.push(l.to_string());
            }
            Some(_) => plan.warnings.push(format!(
                "volume labels are not applied for {}; formatting without one",
                filesystem
            )),
            None => {}
        }
        args.push(device.to_string());

        plan.steps.push(Step::destructive(
            &format!("mkfs.{}", filesystem),
            args,
            format!("Format {} as {}", device, filesystem),
        ));

        plan.targets = vec![device.to_string()];
        Ok(())
    }

    fn plan_fstab_entry(
        &self,
        plan: &mut Plan,
        snapshot: &InventorySnapshot,
        device: &str,
        mountpoint: &str,
        filesystem: &str,
        options: Option<&str>,
    ) -> Result<()> {
        lookup(snapshot, device)?;
        validate_filesystem(filesystem)?;
        validate_mountpoint(mountpoint)?;
        if let Some(opts) = options {
            validate_options(opts)?;
        }

        let format = &self.settings.fstab;
        let entry = FstabEntry {
            spec: fstab::device_spec(device, format),
            mountpoint: mountpoint.to_string(),
            fstype: filesystem.to_string(),
            options: options
                .map(|o| o.to_string())
                .unwrap_or_else(|| format.default_options.clone()),
            dump: format.dump,
            pass: format.pass,
        };

        plan.steps.push(Step::destructive(
            "mkdir",
            vec!["-p".to_string(), mountpoint.to_string()],
            format!("Create mount point {}", mountpoint),
        ));
        plan.steps.push(Step::destructive(
            "sh",
            vec!["-c".to_string(), fstab::append_script(&entry, &format.path)],
            format!("Append fstab entry for {} (skipped when already present)", device),
        ));
        plan.steps.push(Step::destructive(
            "mount",
            vec!["-a".to_string()],
            "Mount all fstab filesystems".to_string(),
        ));

        plan.targets = vec![device.to_string()];
        Ok(())
    }
}

/// Steps that free up a busy device, or an error when `force_teardown`
/// was not requested.
fn teardown_steps(
    dev: &BlockDevice,
    snapshot: &InventorySnapshot,
    force_teardown: bool,
) -> Result<Vec<Step>> {
    let mut steps = Vec::new();

    match dev.role {
        DeviceRole::Free => {}
        DeviceRole::Claimed => {
            return Err(Error::Validation(format!(
                "{} is held by another running plan",
                dev.path
            )));
        }
        DeviceRole::Mounted => {
            if !force_teardown {
                return Err(Error::Validation(format!(
                    "{} is currently mounted; re-run with teardown enabled to unmount it first",
                    dev.path
                )));
            }
            let mounted: Vec<&crate::Partition> = dev
                .partitions
                .iter()
                .filter(|p| p.mountpoint.is_some())
                .collect();
            if mounted.is_empty() {
                steps.push(Step::destructive(
                    "umount",
                    vec![dev.path.clone()],
                    format!("Unmount {}", dev.path),
                ));
            } else {
                for p in mounted {
                    steps.push(Step::destructive(
                        "umount",
                        vec![format!("/dev/{}", p.name)],
                        format!(
                            "Unmount /dev/{} from {}",
                            p.name,
                            p.mountpoint.as_deref().unwrap_or("?")
                        ),
                    ));
                }
            }
        }
        DeviceRole::RaidMember => {
            if !force_teardown {
                return Err(Error::Validation(format!(
                    "{} is an active RAID member; re-run with teardown enabled to stop the array",
                    dev.path
                )));
            }
            let array = snapshot.array_containing(&dev.name).ok_or_else(|| {
                Error::Validation(format!(
                    "{} looks like a RAID member but its array could not be identified; \
                     re-scan and retry",
                    dev.path
                ))
            })?;
            steps.push(Step::destructive(
                "mdadm",
                vec!["--stop".to_string(), format!("/dev/{}", array.name)],
                format!("Stop array /dev/{}", array.name),
            ));
        }
        DeviceRole::BcacheBacking => {
            if !force_teardown {
                return Err(Error::Validation(format!(
                    "{} is an active bcache backing device; re-run with teardown enabled",
                    dev.path
                )));
            }
            steps.push(Step::destructive(
                "sh",
                vec![
                    "-c".to_string(),
                    format!("echo 1 > /sys/block/{}/bcache/stop", dev.name),
                ],
                format!("Detach {} from its bcache set", dev.path),
            ));
        }
        DeviceRole::BcacheCache => {
            if !force_teardown {
                return Err(Error::Validation(format!(
                    "{} is an active bcache cache device; re-run with teardown enabled",
                    dev.path
                )));
            }
            steps.push(Step::destructive(
                "sh",
                vec![
                    "-c".to_string(),
                    format!("echo 1 > /sys/block/{}/bcache/set/stop", dev.name),
                ],
                format!("Stop the cache set served by {}", dev.path),
            ));
        }
    }

    Ok(steps)
}

fn lookup<'a>(snapshot: &'a InventorySnapshot, path: &str) -> Result<&'a BlockDevice> {
    snapshot.get(path).ok_or_else(|| {
        Error::Validation(format!(
            "unknown device {}; it may have been removed; re-scan and retry",
            path
        ))
    })
}

fn ensure_free(dev: &BlockDevice) -> Result<()> {
    match dev.role {
        DeviceRole::Free => Ok(()),
        DeviceRole::Mounted => Err(Error::Validation(format!(
            "{} is currently mounted",
            dev.path
        ))),
        DeviceRole::RaidMember => Err(Error::Validation(format!(
            "{} is already a member of a RAID array",
            dev.path
        ))),
        DeviceRole::BcacheBacking | DeviceRole::BcacheCache => Err(Error::Validation(format!(
            "{} is part of an active bcache set",
            dev.path
        ))),
        DeviceRole::Claimed => Err(Error::Validation(format!(
            "{} is held by another running plan",
            dev.path
        ))),
    }
}

lazy_static! {
    static ref ARRAY_NAME: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("array name regex");
    static ref FS_NAME: Regex = Regex::new(r"^[a-z0-9.]+$").expect("fs name regex");
    static ref MOUNT_OPTS: Regex = Regex::new(r"^[A-Za-z0-9=,._:/-]+$").expect("options regex");
}

fn validate_array_name(name: &str) -> Result<()> {
    if ARRAY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid array name '{}': expected something like md0",
            name
        )))
    }
}

fn validate_filesystem(fs: &str) -> Result<()> {
    if FS_NAME.is_match(fs) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid filesystem type '{}'",
            fs
        )))
    }
}

fn validate_label(label: &str) -> Result<()> {
    if !label.is_empty() && !label.contains(char::is_whitespace) && !label.contains('\'') {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid volume label '{}'", label)))
    }
}

fn validate_mountpoint(mountpoint: &str) -> Result<()> {
    if mountpoint.starts_with('/')
        && !mountpoint.contains(char::is_whitespace)
        && !mountpoint.contains('\'')
    {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid mount point '{}': must be an absolute path without whitespace",
            mountpoint
        )))
    }
}

fn validate_options(options: &str) -> Result<()> {
    if MOUNT_OPTS.is_match(options) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid mount options '{}'",
            options
        )))
    }
}
