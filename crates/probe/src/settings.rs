//! Process-wide tunables.
//!
//! Settings come from whatever was passed to [`install`], otherwise from the
//! `AYD_*` environment variables, otherwise from the defaults. They are read
//! when a resource starts, so changes apply to the next start.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::util::{duration_text, parse_duration};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ping settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// ICMP tunables
    pub ping: PingSettings,

    /// Directories searched for plugin executables before `PATH`
    pub plugin_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PingSettings {
    /// Echo requests sent per check
    pub packets: u32,

    /// Interval between two echo requests
    #[serde(with = "duration_text")]
    pub period: Duration,

    /// Upper bound for one whole check
    #[serde(with = "duration_text")]
    pub timeout: Duration,

    /// Use raw sockets instead of unprivileged datagram sockets
    pub privileged: bool,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            packets: 3,
            period: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            privileged: false,
        }
    }
}

impl PingSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.packets == 0 {
            return Err(SettingsError::Invalid("packets must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(SettingsError::Invalid("timeout must be positive".into()));
        }
        Ok(())
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(text)?;
        settings.ping.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by the `AYD_PING_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Settings::default();
        let ping = &mut settings.ping;

        if let Some(v) = lookup("AYD_PING_PACKETS") {
            match v.trim().parse::<u32>() {
                Ok(n) if n > 0 => ping.packets = n,
                _ => warn!(value = %v, "ignoring invalid AYD_PING_PACKETS"),
            }
        }
        if let Some(v) = lookup("AYD_PING_PERIOD") {
            match parse_duration(&v) {
                Some(d) => ping.period = d,
                None => warn!(value = %v, "ignoring invalid AYD_PING_PERIOD"),
            }
        }
        if let Some(v) = lookup("AYD_PING_TIMEOUT") {
            match parse_duration(&v) {
                Some(d) if !d.is_zero() => ping.timeout = d,
                _ => warn!(value = %v, "ignoring invalid AYD_PING_TIMEOUT"),
            }
        }
        if let Some(v) = lookup("AYD_PING_PRIVILEGED") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => ping.privileged = true,
                "" | "0" | "false" | "no" | "off" => ping.privileged = false,
                _ => warn!(value = %v, "ignoring invalid AYD_PING_PRIVILEGED"),
            }
        }

        settings
    }
}

static INSTALLED: RwLock<Option<Arc<Settings>>> = RwLock::new(None);

/// Use `settings` instead of the environment from now on.
pub fn install(settings: Settings) {
    let mut installed = INSTALLED.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *installed = Some(Arc::new(settings));
}

/// Settings in effect right now.
pub fn current() -> Arc<Settings> {
    let installed = INSTALLED.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    match installed.as_ref() {
        Some(settings) => settings.clone(),
        None => Arc::new(Settings::from_env()),
    }
}
