//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use courier_core::CourierResult;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_secret_file")]
    pub secret_file: String,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_auth_window")]
    pub auth_window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret_file: default_secret_file(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_window_secs: default_auth_window(),
        }
    }
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// `[limits]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_text_bytes: default_max_text_bytes(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5050
}
fn default_secret_file() -> String {
    "~/.courier/secret".to_string()
}
fn default_max_auth_attempts() -> u32 {
    5
}
fn default_auth_window() -> u64 {
    60
}
fn default_db_path() -> String {
    "~/.courier/courier.db".to_string()
}
fn default_max_text_bytes() -> usize {
    4096
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub secret_file: PathBuf,
    pub max_auth_attempts: u32,
    pub auth_window_secs: u64,
    pub db_path: PathBuf,
    pub max_text_bytes: usize,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_db: Option<&str>,
        cli_secret_file: Option<&str>,
    ) -> CourierResult<Self> {
        // Load base config from file
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    courier_core::CourierError::Other(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        // Merge CLI overrides
        let bind_addr = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind_addr);
        let port = cli_port.unwrap_or(file_config.server.port);
        let db_str = cli_db
            .map(|s| s.to_string())
            .unwrap_or(file_config.storage.db_path);
        let secret_str = cli_secret_file
            .map(|s| s.to_string())
            .unwrap_or(file_config.auth.secret_file);

        Ok(Self {
            bind_addr,
            port,
            secret_file: expand_tilde_str(&secret_str),
            max_auth_attempts: file_config.auth.max_auth_attempts,
            auth_window_secs: file_config.auth.auth_window_secs,
            db_path: expand_tilde_str(&db_str),
            max_text_bytes: file_config.limits.max_text_bytes,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}
