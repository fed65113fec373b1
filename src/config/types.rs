//! Configuration types

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Directory service base address used when none is configured
pub const DEFAULT_DIRECTORY_URL: &str = "http://superdeputy.com/ws/1/proxy/";

/// Probe port used when the forwarding rule does not carry one
pub const DEFAULT_PROBE_PORT: u16 = 1022;

fn config_version() -> u32 {
    CONFIG_VERSION
}

/// Root of `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "config_version")]
    pub version: u32,

    #[serde(default)]
    pub directory: DirectorySettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            directory: DirectorySettings::default(),
            probe: ProbeSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

/// External directory service (reachability check, credential lookup, error sink)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub base_url: String,
    /// Per-request timeout; a probe that exceeds it reports 0
    pub timeout_secs: u64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DIRECTORY_URL.to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub default_port: u16,
    pub period_secs: u64,
    pub initial_delay_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PROBE_PORT,
            period_secs: 30,
            initial_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Missed keepalives before the session is declared dead
    pub keepalive_max: usize,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
        }
    }
}
