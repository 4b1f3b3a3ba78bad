//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Chromecast receiver application id to launch.
    /// Override: `PULSECAST_APP_ID`
    pub app_id: String,

    /// PulseAudio server address. Empty uses the default server lookup.
    /// Override: `PULSE_SERVER`
    pub pulse_server: Option<String>,

    /// Seconds between heartbeat PINGs on open control channels.
    pub heartbeat_interval: u64,

    /// Bound on TCP connect plus TLS handshake, in seconds.
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = pulsecast_core::Config::default();
        Self {
            app_id: core.app_id,
            pulse_server: core.pulse_server,
            heartbeat_interval: core.heartbeat_interval,
            connect_timeout: core.connect_timeout,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PULSECAST_APP_ID") {
            if !val.is_empty() {
                self.app_id = val;
            }
        }

        if let Ok(val) = std::env::var("PULSE_SERVER") {
            if !val.is_empty() {
                self.pulse_server = Some(val);
            }
        }
    }

    /// Converts to pulsecast-core's Config type.
    pub fn to_core_config(&self) -> pulsecast_core::Config {
        pulsecast_core::Config {
            app_id: self.app_id.clone(),
            pulse_server: self.pulse_server.clone(),
            heartbeat_interval: self.heartbeat_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_core_defaults() {
        let config = ServerConfig::default();
        let core = config.to_core_config();
        assert_eq!(core.app_id, pulsecast_core::Config::default().app_id);
        assert_eq!(core.heartbeat_interval, 20);
        assert_eq!(core.connect_timeout, 10);
    }
}
