//! Configuration management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, ProxyError, ProxyResult};
use crate::hijack::HijackerConfig;

/// Main configuration structure, stored as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub ca: CaConfig,
    pub hijack: HijackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the dispatcher listens on.
    pub listen: String,
    /// Enable verbose logging.
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Path to the root certificate.
    pub cert_path: PathBuf,
    /// Path to the root private key.
    pub key_path: PathBuf,
    /// Validity of a freshly generated root, in days.
    pub root_validity_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HijackConfig {
    /// Capacity of the minted-certificate cache.
    pub cache_capacity: usize,
    /// Days a minted leaf stays cached before reissue.
    pub vhost_ttl_days: u32,
    /// Extra days of leaf validity beyond the cache deadline.
    pub leaf_margin_days: u32,
    /// Header read timeout for decrypted connections, in milliseconds.
    pub header_read_timeout_ms: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            verbose: false,
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let ca_dir = home.join(".tlstap");
        Self {
            cert_path: ca_dir.join("root-cert.pem"),
            key_path: ca_dir.join("root-key.pem"),
            root_validity_days: 365,
        }
    }
}

impl Default for HijackConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            vhost_ttl_days: 7,
            leaf_margin_days: 7,
            header_read_timeout_ms: None,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tlstap")
            .join("config.toml")
    }

    /// Loads from the default location, or returns defaults when the
    /// file does not exist.
    pub fn load() -> ProxyResult<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> ProxyResult<Self> {
        if path.exists() {
            debug!("loading config from {:?}", path);
            let content = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::NotFound(format!("{}: {e}", path.display())))?;
            let config: Config =
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            debug!("config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> ProxyResult<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> ProxyResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Write(format!("failed to create directory: {e}")))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Write(format!("{}: {e}", path.display())))?;
        info!("saved config to {:?}", path);
        Ok(())
    }

    /// Resolves `~` in configured paths.
    pub fn expand_paths(&mut self) {
        self.ca.cert_path = expand_path(&self.ca.cert_path);
        self.ca.key_path = expand_path(&self.ca.key_path);
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.hijack.cache_capacity == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "hijack.cache_capacity".into(),
                value: "0".into(),
                reason: "capacity must be at least 1".into(),
            });
        }
        if self.hijack.vhost_ttl_days == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "hijack.vhost_ttl_days".into(),
                value: "0".into(),
                reason: "ttl must be at least one day".into(),
            });
        }
        if self.ca.root_validity_days == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "ca.root_validity_days".into(),
                value: "0".into(),
                reason: "root validity must be at least one day".into(),
            });
        }
        Ok(())
    }
}

impl HijackConfig {
    /// Translates file-level settings into the hijacker's tunables.
    pub fn hijacker_config(&self) -> HijackerConfig {
        HijackerConfig {
            cache_capacity: self.cache_capacity,
            vhost_ttl: days(self.vhost_ttl_days),
            leaf_margin: days(self.leaf_margin_days),
            header_read_timeout: self.header_read_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn days(count: u32) -> Duration {
    Duration::from_secs(u64::from(count) * 24 * 60 * 60)
}

fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.as_ref())
}
