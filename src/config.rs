// Runtime configuration: layered file + environment overrides.
//
// Everything the spec leaves as a site convention (privilege escalation
// front-end, fstab entry format, per-step timeout) is decided here rather
// than hard-coded in the planner or executor.

use config::{Config, ConfigError, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Privilege escalation front-end used by the executor.
///
/// This is the single point where elevated privileges enter the picture;
/// individual steps never choose their own escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Escalation {
    /// Run commands as-is (process already runs as root)
    None,
    Sudo,
    Pkexec,
}

impl Escalation {
    /// Wrap a command line in the configured escalation front-end.
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        match self {
            Escalation::None => (program.to_string(), args.to_vec()),
            Escalation::Sudo => {
                let mut v = vec![program.to_string()];
                v.extend(args.iter().cloned());
                ("sudo".to_string(), v)
            }
            Escalation::Pkexec => {
                let mut v = vec![program.to_string()];
                v.extend(args.iter().cloned());
                ("pkexec".to_string(), v)
            }
        }
    }

    /// The binary this front-end invokes, if any.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            Escalation::None => None,
            Escalation::Sudo => Some("sudo"),
            Escalation::Pkexec => Some("pkexec"),
        }
    }
}

/// How generated fstab entries are rendered.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FstabFormat {
    /// Prefer `UUID=` specs over raw device paths when blkid can resolve one
    pub prefer_uuid: bool,
    /// fs_freq field (dump)
    pub dump: u8,
    /// fs_passno field (fsck order)
    pub pass: u8,
    /// Options used when the intent supplies none
    pub default_options: String,
    /// Path of the table itself; overridable for tests
    pub path: PathBuf,
}

impl Default for FstabFormat {
    fn default() -> Self {
        Self {
            prefer_uuid: true,
            dump: 0,
            pass: 2,
            default_options: "defaults".to_string(),
            path: PathBuf::from("/etc/fstab"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub escalation: Escalation,
    /// Default per-step timeout in seconds; steps may override
    pub step_timeout_secs: u64,
    pub fstab: FstabFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            escalation: Escalation::Sudo,
            step_timeout_secs: 600,
            fstab: FstabFormat::default(),
        }
    }
}

impl Settings {
    /// Load `~/.config/blocksmith/config.toml` (optional) with
    /// `BLOCKSMITH_*` environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(dirs) = ProjectDirs::from("", "", "blocksmith") {
            let path = dirs.config_dir().join("config.toml");
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .add_source(Environment::with_prefix("BLOCKSMITH").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}
