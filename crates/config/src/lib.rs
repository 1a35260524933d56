use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::{DEFAULT_TEMPERATURE, GenerationParams, ProviderEndpoint, ProviderId};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod registry;

pub use registry::{ModelRegistry, ProviderModels};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, friendly AI assistant. Answer the user's questions to the best of your ability.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: ProviderId,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub default_model: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

const fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl ProviderSettings {
    pub fn defaults_for(id: ProviderId) -> Self {
        let (base_url, api_key_env, models): (&str, &str, &[&str]) = match id {
            ProviderId::OpenAi => (
                "https://api.openai.com/v1",
                "OPENAI_API_KEY",
                &[
                    "gpt-4.1-2025-04-14",
                    "gpt-4-0613",
                    "gpt-4.5-preview-2025-02-27",
                    "gpt-4-turbo-2024-04-09",
                ],
            ),
            ProviderId::Anthropic => (
                "https://api.anthropic.com",
                "ANTHROPIC_API_KEY",
                &[
                    "claude-3-7-sonnet-20250219",
                    "claude-3-5-sonnet-20240620",
                    "claude-3-5-haiku-20241022",
                ],
            ),
            ProviderId::Gemini => (
                "https://generativelanguage.googleapis.com",
                "GOOGLE_API_KEY",
                &[
                    "gemini-2.0-flash-lite",
                    "gemini-2.0-flash",
                    "gemini-2.5-pro-preview-03-25",
                ],
            ),
        };
        Self {
            id,
            base_url: base_url.to_string(),
            api_key_env: Some(api_key_env.to_string()),
            default_model: models[0].to_string(),
            models: models.iter().map(ToString::to_string).collect(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            top_p: None,
            extra_headers: Vec::new(),
            request_timeout_secs: Some(120),
            enabled: true,
        }
    }

    pub fn endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint {
            id: self.id,
            base_url: self.base_url.clone(),
            extra_headers: self.extra_headers.clone(),
            request_timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub default_system_prompt: String,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            server: ServerConfig::default(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            providers: ProviderId::ALL
                .into_iter()
                .map(ProviderSettings::defaults_for)
                .collect(),
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push("chatrelay");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        self.migrate(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        if config.providers.is_empty() {
            config.providers = AppConfig::default().providers;
        }
        for provider in &mut config.providers {
            if provider.models.is_empty() {
                provider.models = ProviderSettings::defaults_for(provider.id).models;
            }
        }
        if config.default_system_prompt.trim().is_empty() {
            config.default_system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
