use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Generic public downloads location reported to callers on success.
pub const DEFAULT_DOWNLOADS_DIR: &str = "Download";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub bridge: BridgeSettings,
    pub host: HostConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

/// What to do with a request whose completion event arrives while the
/// transfer is still pending, running or paused.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NonTerminalPolicy {
    /// Forget the request; its caller is never resolved.
    #[default]
    Drop,
    /// Register the request again and wait for a later event.
    Requeue,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    pub downloads_dir: String,
    pub non_terminal: NonTerminalPolicy,
    pub exported_listener: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            downloads_dir: DEFAULT_DOWNLOADS_DIR.to_string(),
            non_terminal: NonTerminalPolicy::default(),
            exported_listener: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub root: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: None,
            event_capacity: 64,
        }
    }
}

impl HostConfig {
    /// Configured root, else the user's download directory, else the working directory.
    pub fn resolve_root(&self) -> PathBuf {
        self.root
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file {}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn get_logging_format(&self) -> &str {
        &self.logging.format
    }
}
