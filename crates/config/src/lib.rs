//! Configuration loading, validation, and management for Grantwell.
//!
//! Loads configuration from `~/.grantwell/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use grantwell_core::AgentType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.grantwell/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Reasoning engine API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per engine response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Per-agent overrides, keyed by agent-type tag (e.g. `grant-cards`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentConfig>,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("provider", &self.provider)
            .field("turn", &self.turn)
            .field("storage", &self.storage)
            .field("gateway", &self.gateway)
            .field("agents", &self.agents)
            .finish()
    }
}

/// Reasoning engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Token budget for extended thinking. Thinking is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_timeout_secs() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            thinking_budget: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Turn loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Hard cap on reasoning-engine calls per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Run at most one turn per conversation at a time.
    #[serde(default = "default_true")]
    pub serialize_per_conversation: bool,

    /// Stop a turn once its client has gone away.
    #[serde(default = "default_true")]
    pub cancel_on_disconnect: bool,

    /// Capacity of the push-event channel of each turn.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_true() -> bool {
    true
}
fn default_event_buffer() -> usize {
    128
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            serialize_per_conversation: true,
            cancel_on_disconnect: true,
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sqlite` or `memory`
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite database file. Defaults to `~/.grantwell/grantwell.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("grantwell.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Request body limit; attachments arrive inline as base64.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_port() -> u16 {
    42680
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Overrides for a single agent type. Capability sets are fixed in code
/// and cannot be changed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.grantwell/config.toml).
    ///
    /// Environment variables, highest priority first:
    /// - `GRANTWELL_API_KEY`
    /// - `ANTHROPIC_API_KEY`
    /// - `GRANTWELL_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("GRANTWELL_API_KEY").or_else(|| lookup("ANTHROPIC_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(model) = lookup("GRANTWELL_MODEL") {
            self.model = model;
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".grantwell")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 1.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 1.0".into(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError("max_tokens must be > 0".into()));
        }

        if self.turn.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "turn.max_iterations must be at least 1".into(),
            ));
        }

        if self.turn.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "turn.event_buffer must be > 0".into(),
            ));
        }

        if let Some(budget) = self.provider.thinking_budget {
            if budget >= self.max_tokens {
                return Err(ConfigError::ValidationError(
                    "provider.thinking_budget must be below max_tokens".into(),
                ));
            }
        }

        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown storage backend '{other}' (expected sqlite or memory)"
                )));
            }
        }

        for tag in self.agents.keys() {
            tag.parse::<AgentType>()
                .map_err(ConfigError::ValidationError)?;
        }

        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// System instructions for `agent`, honouring any configured override.
    pub fn instructions_for(&self, agent: AgentType) -> String {
        self.agents
            .get(agent.as_str())
            .and_then(|a| a.instructions.clone())
            .unwrap_or_else(|| agent.default_instructions().to_string())
    }

    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            provider: ProviderConfig::default(),
            turn: TurnConfig::default(),
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
