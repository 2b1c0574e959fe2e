// fstab entry generation.
//
// Entries are keyed on the (spec, mountpoint) pair: re-running the same
// intent never duplicates a line. The rendered format is configurable
// because dump/pass numbers and UUID-vs-path specs are site conventions,
// not tool requirements.

use crate::config::FstabFormat;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// One line of an fstab table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabEntry {
    /// First field: `UUID=…` or a device path
    pub spec: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: String,
    pub dump: u8,
    pub pass: u8,
}

impl FstabEntry {
    pub fn render(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{} {}",
            self.spec, self.mountpoint, self.fstype, self.options, self.dump, self.pass
        )
    }
}

/// Resolve the spec field for a device, honoring the configured preference.
///
/// UUID resolution goes through `blkid -s UUID -o value`; any failure
/// (missing tool, unformatted device) falls back to the raw device path.
pub fn device_spec(device: &str, format: &FstabFormat) -> String {
    if format.prefer_uuid {
        if let Some(uuid) = blkid_uuid(device) {
            return format!("UUID={}", uuid);
        }
    }
    device.to_string()
}

fn blkid_uuid(device: &str) -> Option<String> {
    let output = Command::new("blkid")
        .args(["-s", "UUID", "-o", "value", device])
        .output()
        .map_err(|e| {
            debug!(device, "blkid unavailable: {}", e);
            e
        })
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if uuid.is_empty() {
        None
    } else {
        Some(uuid)
    }
}

/// Does an fstab line already cover this (spec, mountpoint) pair?
fn line_matches(line: &str, spec: &str, mountpoint: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    let mut fields = trimmed.split_whitespace();
    fields.next() == Some(spec) && fields.next() == Some(mountpoint)
}

/// Pure idempotent merge: returns the new table contents and whether the
/// entry was actually appended.
pub fn ensure_entry(contents: &str, entry: &FstabEntry) -> (String, bool) {
    if contents
        .lines()
        .any(|l| line_matches(l, &entry.spec, &entry.mountpoint))
    {
        return (contents.to_string(), false);
    }

    let mut out = contents.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry.render());
    out.push('\n');
    (out, true)
}

/// Merge an entry into a table file on disk. Used directly when the
/// process has write access (tests, root without escalation); the planner
/// otherwise routes the append through the privileged executor.
pub fn ensure_in_file(path: &Path, entry: &FstabEntry) -> Result<bool> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let (merged, appended) = ensure_entry(&contents, entry);
    if appended {
        fs::write(path, merged)?;
    }
    Ok(appended)
}

/// Shell script performing the same idempotent append, for execution
/// through the privileged executor. Spec and mountpoint are validated by
/// the planner (no whitespace or quotes) before they reach this point.
pub fn append_script(entry: &FstabEntry, table: &Path) -> String {
    let table = table.display();
    format!(
        "grep -Eq '^{}[[:space:]]+{}([[:space:]]|$)' {} || printf '%s\\n' '{}' >> {}",
        regex::escape(&entry.spec),
        regex::escape(&entry.mountpoint),
        table,
        entry.render(),
        table
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry() -> FstabEntry {
        FstabEntry {
            spec: "UUID=0a1b2c3d-1111-2222-3333-444455556666".to_string(),
            mountpoint: "/mnt/data".to_string(),
            fstype: "ext4".to_string(),
            options: "defaults,noatime".to_string(),
            dump: 0,
            pass: 2,
        }
    }

    #[test]
    fn renders_tab_separated_line() {
        assert_eq!(
            entry().render(),
            "UUID=0a1b2c3d-1111-2222-3333-444455556666\t/mnt/data\text4\tdefaults,noatime\t0 2"
        );
    }

    #[test]
    fn appends_once_and_only_once() {
        let (first, appended) = ensure_entry("", &entry());
        assert!(appended);

        let (second, appended_again) = ensure_entry(&first, &entry());
        assert!(!appended_again);
        assert_eq!(first, second);

        let count = second
            .lines()
            .filter(|l| l.contains("/mnt/data"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn same_device_different_mountpoint_is_a_new_entry() {
        let (first, _) = ensure_entry("", &entry());
        let mut other = entry();
        other.mountpoint = "/mnt/backup".to_string();

        let (second, appended) = ensure_entry(&first, &other);
        assert!(appended);
        assert_eq!(second.lines().count(), 2);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored_for_matching() {
        let contents = "# UUID=0a1b2c3d-1111-2222-3333-444455556666 /mnt/data\n\n";
        let (_, appended) = ensure_entry(contents, &entry());
        assert!(appended, "a commented-out entry must not block the append");
    }

    #[test]
    fn preserves_missing_trailing_newline() {
        let contents = "/dev/sda1\t/\text4\tdefaults\t0 1";
        let (merged, appended) = ensure_entry(contents, &entry());
        assert!(appended);
        assert!(merged.starts_with("/dev/sda1\t/\text4\tdefaults\t0 1\n"));
        assert!(merged.ends_with('\n'));
    }

    #[test]
    fn file_merge_is_idempotent() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("fstab");

        assert!(ensure_in_file(&table, &entry()).unwrap());
        assert!(!ensure_in_file(&table, &entry()).unwrap());

        let contents = fs::read_to_string(&table).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn append_script_guards_on_spec_and_mountpoint() {
        let script = append_script(&entry(), Path::new("/etc/fstab"));
        assert!(script.contains("grep -Eq"));
        assert!(script.contains(">> /etc/fstab"));
        // UUID dots and dashes must be escaped for grep -E
        assert!(script.contains(r"UUID=0a1b2c3d\-1111\-2222\-3333\-444455556666"));
    }
}
