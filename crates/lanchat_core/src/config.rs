use anyhow::{Context, Result, bail};
use lanchat_network::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Application configuration stored at `~/.lanchat/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanChatConfig {
    /// Display name used for every message in a session. Asked for on first
    /// run when unset.
    pub nickname: Option<String>,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Sockets, discovery and liveness settings.
    pub network: NetworkConfig,
}

impl Default for LanChatConfig {
    fn default() -> Self {
        Self {
            nickname: None,
            log_level: "info".into(),
            network: NetworkConfig::default(),
        }
    }
}

impl LanChatConfig {
    /// Returns the base config directory: `~/.lanchat/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".lanchat"))
    }

    /// Returns the config file path: `~/.lanchat/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.lanchat/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates default if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path, writing defaults there if the
    /// file does not exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Saves config to `~/.lanchat/config.json`.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to_path(&path)
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// The configured nickname, if set and not blank.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }

    /// Store a nickname, trimmed. Blank names are rejected.
    pub fn set_nickname(&mut self, nickname: &str) -> Result<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            bail!("Nickname must not be blank");
        }
        self.nickname = Some(nickname.to_string());
        Ok(())
    }

    /// Check the settings a node cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.network
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid network settings: {e}"))
    }
}
