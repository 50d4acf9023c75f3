//! Daemon configuration
//!
//! Loaded from a YAML file whose path comes from the `SESSIOND_CONFIG`
//! environment variable; every field has a default so an empty file is a
//! valid configuration.

use cg_proto::PolicyRule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/coregate/sessiond.yaml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn default_force_termination_timeout_ms() -> u64 {
    5000
}

fn default_quota_exhaustion_termination_on_init_ms() -> u64 {
    30000
}

fn default_update_interval_secs() -> u64 {
    10
}

fn default_back_off_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// SessionD configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDConfig {
    /// Force-terminate a releasing session after this gap without usage
    #[serde(default = "default_force_termination_timeout_ms")]
    pub session_force_termination_timeout_ms: u64,

    /// WLAN: wait this long before terminating a session created
    /// without monitoring quota
    #[serde(default = "default_quota_exhaustion_termination_on_init_ms")]
    pub quota_exhaustion_termination_on_init_ms: u64,

    /// Enforcement loop tick
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Retry pacing after a failed report round-trip
    #[serde(default = "default_back_off_interval_secs")]
    pub back_off_interval_secs: u64,

    /// Deactivate service when a TERMINATE final grant is exhausted
    #[serde(default = "default_true")]
    pub terminate_service_when_quota_exhausted: bool,

    /// WLAN: terminate sessions whose monitoring wallet is exhausted
    #[serde(default)]
    pub terminate_on_wallet_exhaust: bool,

    /// Static rule definitions loaded at startup
    #[serde(default)]
    pub static_rules: Vec<PolicyRule>,
}

impl Default for SessionDConfig {
    fn default() -> Self {
        Self {
            session_force_termination_timeout_ms: default_force_termination_timeout_ms(),
            quota_exhaustion_termination_on_init_ms:
                default_quota_exhaustion_termination_on_init_ms(),
            update_interval_secs: default_update_interval_secs(),
            back_off_interval_secs: default_back_off_interval_secs(),
            terminate_service_when_quota_exhausted: true,
            terminate_on_wallet_exhaust: false,
            static_rules: Vec::new(),
        }
    }
}

impl SessionDConfig {
    /// Load from a YAML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load from the `SESSIOND_CONFIG` env var, falling back to defaults
    /// when the file is absent
    pub fn load_from_env() -> Self {
        let path =
            std::env::var("SESSIOND_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match Self::load(&path) {
            Ok(config) => {
                log::info!("Loaded configuration from {path}");
                config
            }
            Err(e) => {
                log::warn!("Could not load configuration from {path} ({e}), using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionDConfig::default();
        assert_eq!(config.session_force_termination_timeout_ms, 5000);
        assert_eq!(config.update_interval_secs, 10);
        assert!(config.terminate_service_when_quota_exhausted);
        assert!(!config.terminate_on_wallet_exhaust);
        assert!(config.static_rules.is_empty());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config: SessionDConfig =
            serde_yaml::from_str("session_force_termination_timeout_ms: 1234\n").unwrap();
        assert_eq!(config.session_force_termination_timeout_ms, 1234);
        assert_eq!(config.back_off_interval_secs, 5);
    }

    #[test]
    fn test_parse_wallet_exhaust_toggle() {
        let config: SessionDConfig =
            serde_yaml::from_str("terminate_on_wallet_exhaust: true\n").unwrap();
        assert!(config.terminate_on_wallet_exhaust);
    }
}
