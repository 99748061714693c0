//! Agent configuration loading.
//!
//! A JSON config file with environment-variable overrides (`FLEET_*`).
//! Every field has a workable default so the agent starts with no file at
//! all: the device id falls back to the host name and the scanner to the
//! standard baud probe order.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scanner::DEFAULT_BAUD_RATES;

/// Auto-hangup policy settings as they appear in the config file.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoHangupSettings {
    /// Whether inbound calls are hung up.
    pub enabled: bool,
    /// Delay between call detection and the hangup write, in milliseconds.
    pub hangup_delay_ms: u64,
    /// Minimum spacing between hangups on one port, in milliseconds.
    pub cooldown_ms: u64,
    /// Callers containing any of these substrings are never hung up.
    pub whitelist: Vec<String>,
}

impl Default for AutoHangupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hangup_delay_ms: 200,
            cooldown_ms: 5000,
            whitelist: Vec::new(),
        }
    }
}

/// Configuration for the fleet agent.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Server base URL (http/https; converted to ws/wss for the hub).
    pub server_url: String,
    /// Device identity; defaults to the host name.
    pub device_id: String,
    /// Baud rates probed per port, in order.
    pub baud_rates: Vec<u32>,
    /// Start receivers automatically on ports identified by a scan.
    pub auto_start_on_scan: bool,
    /// Inbound-call auto-hangup policy.
    pub auto_hangup: AutoHangupSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            device_id: default_device_id(),
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            auto_start_on_scan: false,
            auto_hangup: AutoHangupSettings::default(),
        }
    }
}

fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "fleet-agent".to_string())
}

impl AgentConfig {
    /// Load configuration from `path` (when it exists), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid config file {}", path.display()))?
        } else {
            log::info!("no config file at {}; using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        if config.device_id.trim().is_empty() {
            config.device_id = default_device_id();
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FLEET_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(device_id) = std::env::var("FLEET_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Ok(rates) = std::env::var("FLEET_BAUD_RATES") {
            let parsed: Vec<u32> = rates
                .split(',')
                .filter_map(|r| r.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.baud_rates = parsed;
            }
        }
        if let Ok(auto) = std::env::var("FLEET_AUTO_START_ON_SCAN") {
            if let Ok(flag) = auto.parse::<bool>() {
                self.auto_start_on_scan = flag;
            }
        }
        if let Ok(enabled) = std::env::var("FLEET_AUTO_HANGUP_ENABLED") {
            if let Ok(flag) = enabled.parse::<bool>() {
                self.auto_hangup.enabled = flag;
            }
        }
        if let Ok(whitelist) = std::env::var("FLEET_AUTO_HANGUP_WHITELIST") {
            self.auto_hangup.whitelist = whitelist
                .split(',')
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.server_url, "http://localhost:5000");
        assert!(!config.device_id.is_empty());
        assert_eq!(config.baud_rates, DEFAULT_BAUD_RATES.to_vec());
        assert!(config.auto_hangup.enabled);
        assert_eq!(config.auto_hangup.hangup_delay_ms, 200);
        assert_eq!(config.auto_hangup.cooldown_ms, 5000);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AgentConfig::load(Path::new("/nonexistent/agent.json")).unwrap();
        assert_eq!(config.server_url, "http://localhost:5000");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(
            &path,
            r#"{
                "serverUrl": "https://fleet.example.com",
                "deviceId": "edge-42",
                "baudRates": [9600],
                "autoStartOnScan": true,
                "autoHangup": {"enabled": false, "whitelist": ["555"]}
            }"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.server_url, "https://fleet.example.com");
        assert_eq!(config.device_id, "edge-42");
        assert_eq!(config.baud_rates, vec![9600]);
        assert!(config.auto_start_on_scan);
        assert!(!config.auto_hangup.enabled);
        assert_eq!(config.auto_hangup.whitelist, vec!["555".to_string()]);
        // unspecified nested fields keep their defaults
        assert_eq!(config.auto_hangup.hangup_delay_ms, 200);
    }

    #[test]
    fn test_empty_device_id_falls_back_to_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(&path, r#"{"deviceId": "  "}"#).unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert!(!config.device_id.trim().is_empty());
    }
}
