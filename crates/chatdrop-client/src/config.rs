//! Client configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Nick shown as the author of our messages
    pub nick: String,

    /// Identity of the peer we chat with
    pub peer: String,

    /// Where received files are written
    pub download_dir: String,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per `file:chunk` message
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: "me".to_string(),
            peer: "peer".to_string(),
            download_dir: "~/.chatdrop/downloads".to_string(),
            transfer: TransferConfig {
                chunk_size: chatdrop_core::CHUNK_SIZE,
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to the defaults
    pub fn load_or_default(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Expand ~ in download_dir path
    pub fn download_dir(&self) -> std::path::PathBuf {
        expand_path(&self.download_dir)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
