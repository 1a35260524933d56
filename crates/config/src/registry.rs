use core_types::{ChatError, GenerationParams, ProviderEndpoint, ProviderId};
use indexmap::IndexMap;

use crate::{AppConfig, ProviderSettings};

#[derive(Debug, Clone)]
pub struct ProviderModels {
    pub endpoint: ProviderEndpoint,
    pub default_model: String,
    pub models: Vec<String>,
    pub params: GenerationParams,
    pub api_key_env: Option<String>,
}

impl From<&ProviderSettings> for ProviderModels {
    fn from(settings: &ProviderSettings) -> Self {
        let mut models = settings.models.clone();
        if !models.iter().any(|m| m == &settings.default_model) {
            models.insert(0, settings.default_model.clone());
        }
        Self {
            endpoint: settings.endpoint(),
            default_model: settings.default_model.clone(),
            models,
            params: settings.params(),
            api_key_env: settings.api_key_env.clone(),
        }
    }
}

/// Static provider → models mapping, in configuration order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    providers: IndexMap<ProviderId, ProviderModels>,
    default_system_prompt: String,
}

impl ModelRegistry {
    pub fn new(default_system_prompt: impl Into<String>) -> Self {
        Self {
            providers: IndexMap::new(),
            default_system_prompt: default_system_prompt.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(config.default_system_prompt.clone());
        for settings in config.providers.iter().filter(|p| p.enabled) {
            registry.insert(settings.id, ProviderModels::from(settings));
        }
        registry
    }

    pub fn insert(&mut self, provider: ProviderId, models: ProviderModels) {
        self.providers.insert(provider, models);
    }

    pub fn get(&self, provider: ProviderId) -> Option<&ProviderModels> {
        self.providers.get(&provider)
    }

    pub fn contains(&self, provider: ProviderId, model: &str) -> bool {
        self.get(provider)
            .is_some_and(|entry| entry.models.iter().any(|m| m == model))
    }

    pub fn validate(&self, provider: ProviderId, model: &str) -> Result<&ProviderModels, ChatError> {
        let entry = self
            .get(provider)
            .ok_or_else(|| ChatError::UnknownProvider(provider.to_string()))?;
        if !entry.models.iter().any(|m| m == model) {
            return Err(ChatError::InvalidModel {
                provider,
                model: model.to_string(),
            });
        }
        Ok(entry)
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderId> + '_ {
        self.providers.keys().copied()
    }

    pub fn list(&self) -> IndexMap<ProviderId, Vec<String>> {
        self.providers
            .iter()
            .map(|(id, entry)| (*id, entry.models.clone()))
            .collect()
    }

    pub fn default_system_prompt(&self) -> &str {
        &self.default_system_prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_enabled_providers_in_order() {
        let mut config = AppConfig::default();
        config.providers[1].enabled = false;
        let registry = ModelRegistry::from_config(&config);
        let providers: Vec<_> = registry.providers().collect();
        assert_eq!(providers, vec![ProviderId::OpenAi, ProviderId::Gemini]);
        assert_eq!(registry.list()[&ProviderId::Gemini].len(), 3);
    }

    #[test]
    fn validates_models() {
        let registry = ModelRegistry::from_config(&AppConfig::default());
        assert!(registry.contains(ProviderId::Anthropic, "claude-3-5-haiku-20241022"));
        assert!(registry.validate(ProviderId::OpenAi, "gpt-4-0613").is_ok());
        assert!(matches!(
            registry.validate(ProviderId::OpenAi, "claude-3-5-haiku-20241022"),
            Err(ChatError::InvalidModel { provider: ProviderId::OpenAi, .. })
        ));
    }

    #[test]
    fn disabled_provider_is_unknown() {
        let mut config = AppConfig::default();
        config.providers[2].enabled = false;
        let registry = ModelRegistry::from_config(&config);
        assert!(matches!(
            registry.validate(ProviderId::Gemini, "gemini-2.0-flash"),
            Err(ChatError::UnknownProvider(name)) if name == "gemini"
        ));
    }

    #[test]
    fn default_model_is_always_listed() {
        let mut settings = ProviderSettings::defaults_for(ProviderId::OpenAi);
        settings.default_model = "gpt-custom".to_string();
        let entry = ProviderModels::from(&settings);
        assert_eq!(entry.models[0], "gpt-custom");
        assert_eq!(entry.endpoint.base_url, "https://api.openai.com/v1");
    }
}
