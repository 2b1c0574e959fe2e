// Typed model of `lsblk --json --bytes` output.
//
// lsblk changed its JSON quoting across util-linux releases: older versions
// emit every column as a string ("0"/"1", "500107862016"), newer ones emit
// native numbers and booleans. The deserializers below accept both.

use crate::{Error, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::process::Command;

pub(crate) const LSBLK_COLUMNS: &str =
    "NAME,PATH,MODEL,SERIAL,SIZE,TRAN,ROTA,TYPE,PTTYPE,FSTYPE,MOUNTPOINT";

#[derive(Debug, Deserialize)]
pub struct LsblkOutput {
    #[serde(default)]
    pub blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub size: u64,
    #[serde(default)]
    pub tran: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub rota: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub pttype: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    /// Device node path; older lsblk has no PATH column
    pub fn node_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    /// True when this device or any descendant carries a mountpoint
    pub fn any_mounted(&self) -> bool {
        self.mountpoint.is_some() || self.children.iter().any(|c| c.any_mounted())
    }
}

fn flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
        Null,
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse::<u64>().map_err(de::Error::custom),
        NumOrStr::Null => Ok(0),
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStr {
        Bool(bool),
        Str(String),
        Num(u64),
        Null,
    }

    Ok(match BoolOrStr::deserialize(deserializer)? {
        BoolOrStr::Bool(b) => b,
        BoolOrStr::Str(s) => s.trim() == "1" || s.trim().eq_ignore_ascii_case("true"),
        BoolOrStr::Num(n) => n != 0,
        BoolOrStr::Null => false,
    })
}

/// Parse raw `lsblk -J` output.
pub fn parse(json: &str) -> Result<LsblkOutput> {
    serde_json::from_str(json).map_err(|e| Error::Probe(format!("unparseable lsblk output: {}", e)))
}

/// Run `lsblk -J -b` for the whole system (or one device) and parse it.
pub fn query(device: Option<&str>) -> Result<LsblkOutput> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["-J", "-b", "-o", LSBLK_COLUMNS]);
    if let Some(dev) = device {
        cmd.arg(dev);
    }

    let output = cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ToolMissing("lsblk".to_string())
        } else {
            Error::Io(e)
        }
    })?;

    if !output.status.success() {
        return Err(Error::Probe(format!(
            "lsblk exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse(&String::from_utf8_lossy(&output.stdout))
}
