//! Configuration types and the TOML loader.
//!
//! The shape mirrors the constructor parameter list of the process this
//! crate replaces: one struct for the STUN probing policy, one for the
//! supervisor's own knobs, loaded from a single TOML file.

use std::fs;
use std::time::Duration;

use serde::Deserialize;

fn default_stun_host() -> String {
    "stun.l.google.com".to_string()
}
fn default_stun_port() -> u16 {
    19302
}
fn default_stun_timeout_ms() -> u64 {
    1000
}
fn default_stun_retries() -> u32 {
    3
}
fn default_stun_retries_delay_ms() -> u64 {
    100
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_check_retries() -> u32 {
    3
}
fn default_check_retries_delay_ms() -> u64 {
    1000
}
fn default_bin() -> String {
    "live777".to_string()
}

/// STUN probing policy: server coordinates and the per-request retry
/// budget handed straight to [`crate::stun::StunClient::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retries_delay_ms: u64,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            host: default_stun_host(),
            port: default_stun_port(),
            timeout_ms: default_stun_timeout_ms(),
            retries: default_stun_retries(),
            retries_delay_ms: default_stun_retries_delay_ms(),
        }
    }
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries_delay(&self) -> Duration {
        Duration::from_millis(self.retries_delay_ms)
    }
}

/// Top-level supervisor configuration: where the child binary lives, how
/// its argv is templated, and how often the network is re-checked.
///
/// The kill grace period and inter-restart backoff are deliberately not
/// configurable here - they're fixed constants in the `supervisor` module,
/// per the crude-backoff design called out there.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub bin: String,
    pub argv_template: Vec<String>,
    pub argv_remove: Vec<String>,
    pub argv_append: Vec<String>,
    pub check_interval_secs: u64,
    pub check_retries: u32,
    pub check_retries_delay_ms: u64,
    pub stun: StunConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bin: default_bin(),
            argv_template: Vec::new(),
            argv_remove: Vec::new(),
            argv_append: Vec::new(),
            check_interval_secs: default_check_interval_secs(),
            check_retries: default_check_retries(),
            check_retries_delay_ms: default_check_retries_delay_ms(),
            stun: StunConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_retries_delay(&self) -> Duration {
        Duration::from_millis(self.check_retries_delay_ms)
    }
}

/// Loads a [`SupervisorConfig`] from a TOML file at `path`.
pub fn load(path: &str) -> anyhow::Result<SupervisorConfig> {
    let content = fs::read_to_string(path)?;
    let config: SupervisorConfig = toml::from_str(&content)?;
    Ok(config)
}
