//! Switchgrid configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GridError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GridConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl GridConfig {
    /// Load config from the default path (~/.switchgrid/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| GridError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the switchgrid home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchgrid")
    }
}

/// KV store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.switchgrid/store.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

impl StoreConfig {
    /// Store path with `~` expanded, overridable via SWITCHGRID_STORE_PATH.
    pub fn resolved_path(&self) -> PathBuf {
        let raw = std::env::var("SWITCHGRID_STORE_PATH").unwrap_or_else(|_| self.path.clone());
        if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest)
        } else {
            PathBuf::from(raw)
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// When set, every /api request must carry it in `Authorization`.
    #[serde(default)]
    pub api_key: String,
}

fn default_gateway_host() -> String { "127.0.0.1".into() }
fn default_gateway_port() -> u16 { 8080 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_key: String::new(),
        }
    }
}

/// Device transport (EventServer) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_host")]
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
}

fn default_device_host() -> String { "0.0.0.0".into() }
fn default_device_port() -> u16 { 9090 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_device_host(),
            port: default_device_port(),
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_scan_secs() -> u64 { 60 }
fn default_window_secs() -> u64 { 90 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            window_secs: default_window_secs(),
        }
    }
}
