use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Relay server configuration. Loaded from an optional TOML file the same
/// way the agent's config is, with environment/CLI overrides for the
/// fields that matter at deploy time.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8088
}

impl RelayConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| RelayError::Config(format!("invalid TOML: {e}")))
    }
}
