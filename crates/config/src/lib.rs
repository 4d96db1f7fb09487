//! Configuration loading, validation, and management for Rosiwit.
//!
//! Loads configuration from `~/.rosiwit/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! The MCP server registry lives in a separate JSON file, see [`registry`].

pub mod registry;

pub use registry::{McpRegistryFile, ServerDescriptor, ServerEntry, ServerTable, TransportConfig, TransportKind};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.rosiwit/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the inference endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Context window limits
    #[serde(default)]
    pub context: ContextConfig,

    /// MCP client settings
    #[serde(default)]
    pub mcp: McpConfig,

    /// Identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}

/// Redact a secret string for Debug output.
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
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("context", &self.context)
            .field("mcp", &self.mcp)
            .field("identity", &self.identity)
            .field("agent", &self.agent)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum number of non-system turns kept
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Estimated token budget for the whole window
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,
}

fn default_max_messages() -> usize {
    100
}
fn default_context_tokens() -> usize {
    8192
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_tokens: default_context_tokens(),
        }
    }
}

/// How the registry treats the same tool name offered by several servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolNamePolicy {
    /// The first connected server in registry order wins.
    #[default]
    FirstMatch,
    /// Duplicated names are withheld from the catalog and refused at call time.
    Unique,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub tool_name_policy: ToolNamePolicy,

    /// Overrides `~/.rosiwit/mcp.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
}

fn default_connect_timeout() -> u64 {
    30
}
fn default_request_timeout() -> u64 {
    60
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            tool_name_policy: ToolNamePolicy::default(),
            registry_path: None,
        }
    }
}

impl McpConfig {
    /// Resolved location of the server registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(McpRegistryFile::default_path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Persona file; defaults to `~/.rosiwit/SOUL.md`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soul_file: Option<PathBuf>,

    /// Rules file; defaults to `~/.rosiwit/RULE.md`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,

    /// Override the system prompt entirely (skips file loading)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

impl IdentityConfig {
    pub fn soul_path(&self) -> PathBuf {
        self.soul_file
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("SOUL.md"))
    }

    pub fn rules_path(&self) -> PathBuf {
        self.rules_file
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("RULE.md"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on model round-trips per user request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.rosiwit/config.toml).
    ///
    /// Also checks environment variables:
    /// - `ROSIWIT_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `OPENAI_BASE_URL`
    /// - `ROSIWIT_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
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

    fn apply_env(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("ROSIWIT_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            self.base_url = base_url;
        }

        if let Ok(model) = std::env::var("ROSIWIT_MODEL") {
            self.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".rosiwit")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context.max_messages == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_messages must be > 0".into(),
            ));
        }

        if self.context.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_tokens must be > 0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            context: ContextConfig::default(),
            mcp: McpConfig::default(),
            identity: IdentityConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Get the user's home directory.
pub(crate) fn dirs_home() -> PathBuf {
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

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Unknown MCP server '{0}'")]
    UnknownServer(String),
}
