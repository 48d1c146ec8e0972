//! Configuration file support for mcphub
//!
//! Settings are loaded from `~/.mcphub/config.toml` (or `$MCPHUB_HOME/config.toml`).
//! Environment variables override config file settings.
//!
//! Backend server definitions live separately in `mcp.json`, project-local
//! `.mcphub/mcp.json` first, then `$MCPHUB_HOME/mcp.json`.

use crate::client::Deadlines;
use crate::protocol::{DEFAULT_PROTOCOL_VERSION, McpServerConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root directory for mcphub state (`$MCPHUB_HOME`, default `~/.mcphub`)
pub fn mcphub_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("MCPHUB_HOME") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("No home directory"))?;
    Ok(home.join(".mcphub"))
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Identity and protocol revision of the hub's own protocol server
    pub server: ServerConfig,

    /// Function-name bridge housekeeping
    pub bridge: BridgeConfig,

    /// Backend client behaviour
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name reported in `serverInfo` (default: "mcphub")
    pub name: String,
    /// Version reported in `serverInfo` (default: crate version)
    pub version: String,
    /// The only protocol revision accepted in `initialize`
    pub protocol_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcphub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Pending tool calls older than this are swept (default: 600)
    pub pending_call_max_age_secs: u64,
    /// How often the sweeper runs (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pending_call_max_age_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl BridgeConfig {
    pub fn pending_call_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_call_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Deadline for the `initialize` handshake with a backend (default: 30)
    pub handshake_timeout_secs: u64,
    /// Deadline for every other backend request. Unset (the default) or 0
    /// waits as long as the backend takes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            request_timeout_secs: None,
        }
    }
}

impl BackendSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            handshake: self.handshake_timeout(),
            request: self.request_timeout(),
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Option<PathBuf> {
        mcphub_dir().ok().map(|d| d.join("config.toml"))
    }

    /// Load config from file, with environment variable overrides
    pub fn load() -> Self {
        let mut config = Self::path()
            .and_then(|path| Self::load_from_file(&path))
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Load config from a specific file (no env overrides)
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<Self>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::error(&format!("Failed to parse config file: {}", e));
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MCPHUB_SERVER_NAME") {
            self.server.name = v;
        }
        if let Some(v) = lookup("MCPHUB_PROTOCOL_VERSION") {
            self.server.protocol_version = v;
        }
        if let Some(v) = lookup("MCPHUB_PENDING_CALL_MAX_AGE_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.bridge.pending_call_max_age_secs = secs;
            }
        }
        if let Some(v) = lookup("MCPHUB_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.bridge.sweep_interval_secs = secs;
            }
        }
        if let Some(v) = lookup("MCPHUB_HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.backend.handshake_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("MCPHUB_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.backend.request_timeout_secs = Some(secs);
            }
        }
    }
}

/// Backend server definitions (`mcp.json`)
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl BackendConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load from default locations
    pub fn load() -> Self {
        let local = Path::new(".mcphub/mcp.json");
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => return config,
                Err(e) => crate::logging::warn(&format!("{:#}", e)),
            }
        }

        if let Ok(dir) = mcphub_dir() {
            let global = dir.join("mcp.json");
            if global.exists() {
                match Self::load_from_file(&global) {
                    Ok(config) => return config,
                    Err(e) => crate::logging::warn(&format!("{:#}", e)),
                }
            }
        }

        Self::default()
    }
}
