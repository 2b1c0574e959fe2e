// Typed model of `smartctl --json` output and its mapping to HealthReport.
//
// Only the sections this crate consumes are modelled; smartctl emits far
// more. Unknown fields are ignored so new smartmontools releases don't
// break parsing.

use crate::health::{HealthReport, SelfTestRecord, SmartAttribute, TestOutcome};
use crate::{Error, HealthVerdict, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SmartctlJson {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub smart_status: Option<SmartStatus>,
    #[serde(default)]
    pub ata_smart_attributes: Option<AtaAttributes>,
    #[serde(default)]
    pub ata_smart_data: Option<AtaSmartData>,
    #[serde(default)]
    pub ata_smart_self_test_log: Option<SelfTestLog>,
    #[serde(default)]
    pub nvme_smart_health_information_log: Option<NvmeHealthLog>,
}

#[derive(Debug, Deserialize)]
pub struct SmartStatus {
    pub passed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttributes {
    #[serde(default)]
    pub table: Vec<AtaAttribute>,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttribute {
    pub id: u8,
    pub name: String,
    pub value: i64,
    pub worst: i64,
    pub thresh: i64,
    #[serde(default)]
    pub when_failed: String,
    pub raw: RawValue,
}

#[derive(Debug, Deserialize)]
pub struct RawValue {
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub string: String,
}

#[derive(Debug, Deserialize)]
pub struct AtaSmartData {
    #[serde(default)]
    pub self_test: Option<SelfTestSection>,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestSection {
    pub status: SelfTestStatus,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestStatus {
    #[serde(default)]
    pub string: Option<String>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub remaining_percent: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestLog {
    #[serde(default)]
    pub standard: Option<SelfTestTable>,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestTable {
    #[serde(default)]
    pub table: Vec<SelfTestEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestEntry {
    #[serde(rename = "type")]
    pub kind: TypedString,
    pub status: SelfTestEntryStatus,
}

#[derive(Debug, Deserialize)]
pub struct TypedString {
    #[serde(default)]
    pub string: String,
}

#[derive(Debug, Deserialize)]
pub struct SelfTestEntryStatus {
    #[serde(default)]
    pub string: String,
    #[serde(default)]
    pub passed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct NvmeHealthLog {
    #[serde(default)]
    pub critical_warning: i64,
    #[serde(default)]
    pub temperature: Option<i64>,
    #[serde(default)]
    pub available_spare: Option<i64>,
    #[serde(default)]
    pub available_spare_threshold: Option<i64>,
    #[serde(default)]
    pub percentage_used: Option<i64>,
    #[serde(default)]
    pub media_errors: Option<i64>,
    #[serde(default)]
    pub power_on_hours: Option<i64>,
    #[serde(default)]
    pub unsafe_shutdowns: Option<i64>,
}

/// Parse raw smartctl JSON.
pub fn parse(json: &str) -> Result<SmartctlJson> {
    serde_json::from_str(json)
        .map_err(|e| Error::Probe(format!("unparseable smartctl output: {}", e)))
}

/// Map a parsed smartctl document to the report the prober hands out.
pub fn to_report(device: &str, doc: &SmartctlJson) -> HealthReport {
    let verdict = match &doc.smart_status {
        Some(s) if s.passed => HealthVerdict::Passed,
        Some(_) => HealthVerdict::Failed,
        None => HealthVerdict::Unknown,
    };

    let mut attributes: Vec<SmartAttribute> = doc
        .ata_smart_attributes
        .iter()
        .flat_map(|a| a.table.iter())
        .map(|a| SmartAttribute {
            id: a.id,
            name: a.name.clone(),
            value: a.value,
            worst: a.worst,
            threshold: a.thresh,
            raw: if a.raw.string.is_empty() {
                a.raw.value.to_string()
            } else {
                a.raw.string.clone()
            },
            failing_now: a.when_failed == "now",
            failed_before: a.when_failed == "past",
        })
        .collect();

    // NVMe drives report a health log instead of an attribute table;
    // flatten the counters into the same shape the caller already handles.
    if attributes.is_empty() {
        if let Some(log) = &doc.nvme_smart_health_information_log {
            let mut push = |name: &str, value: Option<i64>| {
                if let Some(v) = value {
                    attributes.push(SmartAttribute {
                        id: 0,
                        name: name.to_string(),
                        value: v,
                        worst: v,
                        threshold: 0,
                        raw: v.to_string(),
                        failing_now: false,
                        failed_before: false,
                    });
                }
            };
            push("Critical_Warning", Some(log.critical_warning));
            push("Temperature_Celsius", log.temperature);
            push("Available_Spare_Pct", log.available_spare);
            push("Percentage_Used", log.percentage_used);
            push("Media_Errors", log.media_errors);
            push("Power_On_Hours", log.power_on_hours);
            push("Unsafe_Shutdowns", log.unsafe_shutdowns);
        }
    }

    let in_progress = doc
        .ata_smart_data
        .as_ref()
        .and_then(|d| d.self_test.as_ref())
        .and_then(|t| t.status.remaining_percent);

    // Most recent entry first in smartctl's log
    let last_test = doc
        .ata_smart_self_test_log
        .as_ref()
        .and_then(|l| l.standard.as_ref())
        .and_then(|t| t.table.first())
        .map(|entry| SelfTestRecord {
            kind: entry.kind.string.clone(),
            outcome: match entry.status.passed {
                _ if in_progress.is_some() => TestOutcome::InProgress(in_progress.unwrap_or(0)),
                Some(true) => TestOutcome::Passed,
                Some(false) => TestOutcome::Failed(entry.status.string.clone()),
                None => TestOutcome::NotRun,
            },
        });

    HealthReport {
        device: device.to_string(),
        model: doc.model_name.clone(),
        serial: doc.serial_number.clone(),
        verdict,
        last_test,
        attributes,
    }
}
