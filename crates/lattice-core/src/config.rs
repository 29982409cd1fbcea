//! Daemon configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LATTICE_CONFIG (explicit override)
//!   2. ./lattice.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
    pub coordination: CoordinationConfig,
    pub bundles: BundleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port serving both the websocket hub and the HTTP surface.
    /// 0 = OS-assigned (used by tests).
    pub port: u16,
    /// Raw public-key blob served on /public-key. Missing file = empty blob.
    pub public_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key/value store directory.
    pub data_dir: PathBuf,
    /// Bootstrap config document loaded through the reload path at startup,
    /// if the file exists.
    pub bootstrap_config: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity TTL for standard sessions.
    pub ttl_secs: u64,
    /// Inactivity TTL for ephemeral sessions before promotion.
    pub ephemeral_ttl_secs: u64,
    /// Sweep interval for the TTL watcher.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Window within which a once id stays taken.
    pub once_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub lib_zip: PathBuf,
    pub assets_zip: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            sessions: SessionConfig::default(),
            coordination: CoordinationConfig::default(),
            bundles: BundleConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1234,
            public_key_path: PathBuf::from("public.key"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("lattice-data"),
            bootstrap_config: PathBuf::from("config.json"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            ephemeral_ttl_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            once_ttl_secs: 60 * 60,
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            lib_zip: PathBuf::from("lib.zip"),
            assets_zip: PathBuf::from("assets.zip"),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LatticeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LatticeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LATTICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("lattice.toml"))
    }

    /// Apply LATTICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LATTICE_PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("LATTICE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
    }
}
