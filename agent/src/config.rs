use std::path::Path;

use serde::Deserialize;

use crate::error::{AgentError, Result};

/// Agent configuration: environment variables are authoritative, with an
/// optional TOML file supplying defaults for everything but the device
/// token (§6).
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,

    pub device_token: String,

    #[serde(default = "default_relay_url")]
    pub relay_websocket_url: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default)]
    pub network_range: Option<String>,
}

fn default_cloud_url() -> String {
    "https://api.example-camera-cloud.com".to_string()
}

fn default_relay_url() -> String {
    "wss://relay.example-camera-cloud.com".to_string()
}

fn default_heartbeat_interval() -> u64 {
    15
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read config file: {e}")))?;
        let config: AgentConfig =
            toml::from_str(&content).map_err(|e| AgentError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from environment variables, falling back to
    /// an optional TOML file for anything not set. `device_token` is
    /// required; its absence is the one fatal startup condition (§7, exit
    /// code 1).
    pub fn from_env(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => AgentConfig {
                cloud_url: default_cloud_url(),
                device_token: String::new(),
                relay_websocket_url: default_relay_url(),
                heartbeat_interval_seconds: default_heartbeat_interval(),
                network_range: None,
            },
        };

        if let Ok(url) = std::env::var("cloud_url") {
            config.cloud_url = url;
        }
        if let Ok(token) = std::env::var("device_token") {
            config.device_token = token;
        }
        if let Ok(url) = std::env::var("relay_websocket_url") {
            config.relay_websocket_url = url;
        }
        if let Ok(secs) = std::env::var("heartbeat_interval_seconds") {
            config.heartbeat_interval_seconds = secs
                .parse()
                .map_err(|_| AgentError::Config("heartbeat_interval_seconds must be an integer".to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device_token.is_empty() {
            return Err(AgentError::Config("device_token is required".to_string()));
        }
        if !(10..=30).contains(&self.heartbeat_interval_seconds) {
            // Spec allows a configurable 10-30s range; outside it we still
            // accept the value but it's almost certainly a mistake.
            tracing::warn!(
                seconds = self.heartbeat_interval_seconds,
                "heartbeat_interval_seconds outside the recommended 10-30s range"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_token() {
        let config = AgentConfig {
            cloud_url: default_cloud_url(),
            device_token: String::new(),
            relay_websocket_url: default_relay_url(),
            heartbeat_interval_seconds: 15,
            network_range: None,
        };
        assert!(config.validate().is_err());
    }
}
