//! Hypervisor-level settings.
//!
//! Settings are read from a TOML file, either given explicitly or found at
//! `<config dir>/shuairan/settings.toml`. A missing default file yields the
//! defaults; a malformed file is an error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for settings file storage.
const APP_NAME: &str = "shuairan";

/// Settings file name inside the application config directory.
const SETTINGS_FILE: &str = "settings.toml";

/// Default grace period for vCPU control acknowledgements.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default number of VMs one hypervisor process hosts.
pub const DEFAULT_MAX_VMS: usize = 1;

/// Hypervisor-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HypervisorSettings {
    /// How long the control thread waits for vCPUs to acknowledge
    /// run/pause/resume/stop before treating them as unresponsive.
    pub grace_period_ms: u64,

    /// Maximum number of live VMs.
    pub max_vms: usize,

    /// Logging settings.
    pub log: LogSettings,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            max_vms: DEFAULT_MAX_VMS,
            log: LogSettings::default(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// Level for shuairan's own targets when `RUST_LOG` is unset.
    pub level: String,

    /// Append log output to this file instead of stderr.
    pub file: Option<PathBuf>,

    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
            json: false,
        }
    }
}

impl HypervisorSettings {
    /// Default settings file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    /// Load settings.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// location is tried and defaults are used when nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load settings from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config("load", format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_toml(&text)
            .map_err(|e| Error::config("parse", format!("{}: {}", path.display(), e)))?;
        settings
            .validate()
            .map_err(|e| Error::config("validate", format!("{}: {}", path.display(), e)))?;
        Ok(settings)
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.grace_period_ms == 0 {
            return Err("grace_period_ms must be greater than 0".to_string());
        }
        if self.max_vms == 0 {
            return Err("max_vms must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Parse settings from TOML text.
    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Grace period as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Override the grace period. Must be at least one millisecond.
    pub fn set_grace_period(&mut self, grace_period: Duration) -> Result<()> {
        let millis = u64::try_from(grace_period.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Err(Error::config(
                "set grace period",
                format!("{} is shorter than 1ms", humantime::format_duration(grace_period)),
            ));
        }
        self.grace_period_ms = millis;
        Ok(())
    }
}
