//! Daemon Configuration
//!
//! Configuration management for the Kolimeet sync agent. Stored as TOML
//! under the platform config directory
//! (`~/.config/kolimeet/daemon.toml` on Linux) and written with defaults
//! on first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Typing presence tuning
    #[serde(default)]
    pub typing: TypingConfig,

    /// Change-router configuration
    #[serde(default)]
    pub router: RouterConfig,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Authenticated user id (generated and persisted if not set)
    #[serde(default)]
    pub user_id: Option<Uuid>,

    /// Conversation history window size
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Typing presence tuning
///
/// The defaults implement the protocol constants; overrides exist for
/// integration environments that compress timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Producer idle window before announcing not-typing, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Observer freshness window for a typing announcement, in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl TypingConfig {
    /// Producer idle window as a duration
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Observer freshness window as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Change-router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Surface a toast when a followed listing is deleted
    #[serde(default = "default_true")]
    pub listing_delete_toast: bool,
}

fn default_page_size() -> usize {
    50
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_ttl_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            page_size: default_page_size(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listing_delete_toast: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            typing: TypingConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("Could not determine config directory")?;
        Ok(base.join("kolimeet").join("daemon.toml"))
    }

    /// Load configuration, writing defaults on first run
    ///
    /// A generated user id is persisted so the identity is stable across
    /// restarts.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Config::default()
        };

        if config.session.user_id.is_none() {
            config.session.user_id = Some(Uuid::new_v4());
        }

        config.save(&path)?;
        Ok(config)
    }

    /// Persist configuration to `path`
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
