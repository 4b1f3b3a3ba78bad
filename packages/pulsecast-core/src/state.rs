//! Core configuration.

use std::time::Duration;

use serde::Deserialize;

/// Application id of the default receiver application.
///
/// This is the web receiver registered for Pulsecast; it opens a websocket
/// back to the daemon and plays the raw PCM it receives.
pub const DEFAULT_APP_ID: &str = "2B0D60E4";

/// Core configuration shared by the library subsystems.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chromecast receiver application id to launch.
    pub app_id: String,

    /// PulseAudio server address. `None` uses the default server lookup.
    pub pulse_server: Option<String>,

    /// Seconds between heartbeat PINGs on an open control channel.
    pub heartbeat_interval: u64,

    /// Bound on TCP connect plus TLS handshake, in seconds.
    pub connect_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            pulse_server: None,
            heartbeat_interval: 20,
            connect_timeout: 10,
        }
    }
}

impl Config {
    /// Heartbeat period as a [`Duration`].
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_builtin_receiver() {
        let config = Config::default();
        assert_eq!(config.app_id, DEFAULT_APP_ID);
        assert_eq!(config.heartbeat(), Duration::from_secs(20));
    }
}
