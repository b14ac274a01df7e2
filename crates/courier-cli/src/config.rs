//! Client configuration at `~/.courier/cli.toml`.
//!
//! Provides default server URL, identity, and bearer token settings.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Server URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Identity (phone number) to authenticate as (empty = none).
    #[serde(default)]
    pub identity: String,

    /// Hex-encoded bearer token (empty = none).
    #[serde(default)]
    pub token: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            identity: String::new(),
            token: String::new(),
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:5050".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;

        Ok(())
    }
}

/// Validate an identity: a `+`-prefixed phone number, E.164 style.
pub fn parse_identity(identity: &str) -> Result<String> {
    let identity = identity.trim();
    let Some(digits) = identity.strip_prefix('+') else {
        anyhow::bail!("identity '{identity}' must start with '+'");
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("identity '{identity}' must be '+' followed by digits only");
    }
    if !(7..=15).contains(&digits.len()) {
        anyhow::bail!("identity '{identity}' must have 7 to 15 digits");
    }
    Ok(identity.to_string())
}
