// SMART health probing.
//
// Self-test issuance is fire-and-forget: `smartctl -t` hands the test to
// the drive firmware and returns at once, so the prober never blocks the
// caller. Progress is observed by re-reading the report.

pub mod smartctl;


use crate::inventory::should_skip_device;
use crate::{Error, HealthVerdict, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Health snapshot for one device, immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub device: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub verdict: HealthVerdict,
    /// Most recent self-test, if the drive has ever run one
    pub last_test: Option<SelfTestRecord>,
    pub attributes: Vec<SmartAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestRecord {
    /// smartctl's test-type label, e.g. "Short offline"
    pub kind: String,
    pub outcome: TestOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    Passed,
    Failed(String),
    /// Remaining percentage as reported by the drive
    InProgress(u8),
    NotRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartAttribute {
    pub id: u8,
    pub name: String,
    pub value: i64,
    pub worst: i64,
    pub threshold: i64,
    pub raw: String,
    pub failing_now: bool,
    pub failed_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelfTestKind {
    Short,
    Long,
}

impl SelfTestKind {
    fn smartctl_arg(&self) -> &'static str {
        match self {
            SelfTestKind::Short => "short",
            SelfTestKind::Long => "long",
        }
    }
}

/// Receipt for an issued self-test. The test itself runs inside the drive;
/// poll `HealthProber::read_report` to observe progress and completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestHandle {
    pub device: String,
    pub kind: SelfTestKind,
    pub issued_at: DateTime<Utc>,
}

pub struct HealthProber;

impl HealthProber {
    /// Read the current SMART report for a device.
    pub fn read_report(device: &str) -> Result<HealthReport> {
        Self::ensure_supported(device)?;

        let raw = Self::smartctl_json(device)?;
        let doc = smartctl::parse(&raw)?;
        Ok(smartctl::to_report(device, &doc))
    }

    /// Start a short (typically ~2 min) drive self-test.
    pub fn run_quick_test(device: &str) -> Result<TestHandle> {
        Self::start_test(device, SelfTestKind::Short)
    }

    /// Start an extended self-test. Can take hours; returns immediately.
    pub fn run_long_test(device: &str) -> Result<TestHandle> {
        Self::start_test(device, SelfTestKind::Long)
    }

    fn start_test(device: &str, kind: SelfTestKind) -> Result<TestHandle> {
        Self::ensure_supported(device)?;

        let output = Command::new("smartctl")
            .args(["-t", kind.smartctl_arg(), device])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing("smartctl".to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(Error::Probe(format!(
                "smartctl -t {} failed on {}: {}",
                kind.smartctl_arg(),
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(device, ?kind, "self-test issued");

        Ok(TestHandle {
            device: device.to_string(),
            kind,
            issued_at: Utc::now(),
        })
    }

    /// Virtual and composite devices carry no SMART interface.
    fn ensure_supported(device: &str) -> Result<()> {
        let name = Path::new(device)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(device);

        if should_skip_device(name) || name.starts_with("md") || name.starts_with("bcache") {
            return Err(Error::UnsupportedDevice(device.to_string()));
        }

        Ok(())
    }

    fn smartctl_json(device: &str) -> Result<String> {
        let output = Command::new("smartctl")
            .args(["--json", "-H", "-A", "-l", "selftest", device])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing("smartctl".to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        // smartctl sets exit bits even while producing a full JSON document
        // (e.g. bit 3 when the drive itself is failing), so the document is
        // authoritative whenever present.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(Error::Probe(format!(
                "smartctl produced no output for {}: {}",
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(stdout.into_owned())
    }
}
