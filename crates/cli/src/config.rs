use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::RuntimeConfig;
use proto::{AutonomyLevel, ConfigError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Known LLM provider presets.
///
/// Each preset supplies a default model ID so that users only have to
/// specify what differs from the preset defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreset {
    /// Anthropic Messages API. Default.
    #[default]
    Anthropic,
    /// OpenAI Chat Completions.
    OpenAi,
    /// OpenRouter (OpenAI-compatible).
    OpenRouter,
}

impl ProviderPreset {
    pub const fn all() -> &'static [Self] {
        &[Self::Anthropic, Self::OpenAi, Self::OpenRouter]
    }

    /// Default model ID for the preset. Used when `AgentConfig::model` is empty.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-6",
            Self::OpenAi => "gpt-4o",
            Self::OpenRouter => "openai/gpt-4o",
        }
    }

    /// Name of the provider-specific API key environment variable.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Canonical lowercase name, matching the provider's own `name()`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
        }
    }
}

impl std::str::FromStr for ProviderPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent provider/model configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Per-tool autonomy defaults, e.g. `"sms.send" = "ask"`.
    #[serde(default)]
    pub autonomy: HashMap<String, AutonomyLevel>,

    /// Conversation storage.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Where explicit autonomy decisions are persisted.
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_max_iterations() -> usize {
    10
}

fn default_max_tokens() -> u32 {
    agent::llm::DEFAULT_MAX_TOKENS
}

fn default_stream() -> bool {
    true
}

fn default_history_limit() -> usize {
    40
}

/// Agent model/provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider preset: anthropic | openai | openrouter.
    #[serde(default)]
    pub provider: ProviderPreset,
    /// Model ID. Leave empty (or omit) to use the preset default.
    #[serde(default)]
    pub model: String,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// Explicit API base URL for proxies or self-hosted gateways.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Tool rounds per message before giving up; `0` is unlimited.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Messages of history sent with each request; `0` sends everything.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Seconds an approval prompt waits before the call is denied.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: ProviderPreset::default(),
            model: String::new(),
            api_key: String::new(),
            base_url: None,
            max_iterations: default_max_iterations(),
            max_tokens: default_max_tokens(),
            stream: default_stream(),
            history_limit: default_history_limit(),
            approval_timeout_secs: None,
        }
    }
}

impl AgentConfig {
    /// Returns the effective model ID.
    /// Falls back to the preset default when `model` is empty.
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    /// Explicit base URL, ignoring empty strings.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// Database storage config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. Empty keeps conversations in memory only.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: pilot_home().join("memory.db").to_string_lossy().to_string(),
        }
    }
}

/// Autonomy policy persistence config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// JSON file holding explicit per-tool levels.
    pub path: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: pilot_home().join("policy.json").to_string_lossy().to_string(),
        }
    }
}

/// `~/.pilot`, or `./.pilot` when `HOME` is unset.
pub fn pilot_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".pilot")
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join("pilot.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home_config = pilot_home().join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = match config_path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(&path)?)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;

        debug!(
            provider = %config.agent.provider.name(),
            model = %config.agent.effective_model(),
            base_url = ?config.agent.effective_base_url(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// `PILOT_*` variables win over the file.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(provider) = std::env::var("PILOT_PROVIDER") {
            self.agent.provider =
                provider
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        field: "PILOT_PROVIDER".to_string(),
                        reason,
                    })?;
        }
        if let Ok(key) = std::env::var("PILOT_API_KEY") {
            self.agent.api_key = key;
        }
        if let Ok(model) = std::env::var("PILOT_MODEL") {
            self.agent.model = model;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_tokens".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves the API key for the active provider.
    ///
    /// Priority: `agent.api_key` (or `PILOT_API_KEY`), then the vendor
    /// variable such as `ANTHROPIC_API_KEY`.
    pub fn resolve_api_key(&self) -> String {
        if !self.agent.api_key.is_empty() {
            debug!(source = "config", provider = %self.agent.provider.name(), "API key resolved");
            return self.agent.api_key.clone();
        }
        self.vendor_key(self.agent.provider).unwrap_or_default()
    }

    /// Key from a preset's own environment variable, if set and non-empty.
    pub fn vendor_key(&self, preset: ProviderPreset) -> Option<String> {
        let key = std::env::var(preset.api_key_env()).ok()?;
        if key.is_empty() {
            return None;
        }
        debug!(source = "env", provider = %preset.name(), "API key resolved");
        Some(key)
    }

    /// Path of the persisted autonomy policy.
    pub fn policy_path(&self) -> PathBuf {
        expand_home(&self.policy.path)
    }

    /// Loop settings for the agent runtime.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_iterations: self.agent.max_iterations,
            max_tokens: self.agent.max_tokens,
            history_limit: self.agent.history_limit,
            streaming: self.agent.stream,
            approval_timeout: self.agent.approval_timeout_secs.map(Duration::from_secs),
            ..RuntimeConfig::default()
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}
