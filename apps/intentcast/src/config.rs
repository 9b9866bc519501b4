//! Server configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/intentcast/server.toml`
//! - Windows: `%APPDATA%/intentcast/server.toml`
//!
//! `INTENTCAST_CONFIG` overrides the path.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use intentcast_protocol::FieldType;
use intentcast_protocol::constants::DEFAULT_FREQUENCY;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "INTENTCAST_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket server binds.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long stopped repeaters stay visible in statistics.
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    /// Frequency used when a request omits one.
    #[serde(default = "default_frequency")]
    pub default_frequency: f64,

    /// Field type used when a request omits one.
    #[serde(default = "default_field_type")]
    pub default_field_type: FieldType,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    5000
}

fn default_grace_window_ms() -> u64 {
    5000
}

fn default_frequency() -> f64 {
    DEFAULT_FREQUENCY
}

fn default_field_type() -> FieldType {
    FieldType::Torus
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            grace_window_ms: default_grace_window_ms(),
            default_frequency: default_frequency(),
            default_field_type: default_field_type(),
            log_level: None,
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Loads configuration from `path`, writing defaults there if missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Writes the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.default_frequency.is_finite() || self.default_frequency <= 0.0 {
            anyhow::bail!(
                "default_frequency must be a positive number, got {}",
                self.default_frequency
            );
        }
        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

/// Returns the configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("intentcast")
            .join("server.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("intentcast").join("server.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/intentcast/server.toml"))
    }
}
