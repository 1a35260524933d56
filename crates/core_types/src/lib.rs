use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SessionId = String;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send + 'static>>;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    #[serde(alias = "google")]
    Gemini,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "anthropic" => Ok(ProviderId::Anthropic),
            "gemini" | "google" => Ok(ProviderId::Gemini),
            _ => Err(ChatError::UnknownProvider(value.to_string())),
        }
    }
}

/// Speaker of a transcript turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Role of a message as sent to a provider; the system prompt is never a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub ordinal: usize,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.into(),
            content: turn.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            top_p: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

impl GenerateRequest {
    /// Joined content of every system message, for vendors that take the
    /// instruction outside the message list.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|msg| msg.role == MessageRole::System)
            .map(|msg| msg.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages
            .iter()
            .filter(|msg| msg.role != MessageRole::System)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderEndpoint {
    pub id: ProviderId,
    pub base_url: String,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    AuthFailure,
    RateLimited,
    NetworkError,
    InvalidModel,
    Upstream,
    MalformedResponse,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::AuthFailure => "authentication failed",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::NetworkError => "network error",
            ProviderErrorKind::InvalidModel => "invalid model",
            ProviderErrorKind::Upstream => "upstream error",
            ProviderErrorKind::MalformedResponse => "malformed response",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthFailure, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NetworkError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, message)
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("session `{0}` is not configured, configure a model first")]
    SessionNotFound(SessionId),

    #[error("unsupported provider: {0}")]
    UnknownProvider(String),

    #[error("model `{model}` is not available for provider {provider}")]
    InvalidModel { provider: ProviderId, model: String },

    #[error("no api key supplied for provider {0}")]
    MissingApiKey(ProviderId),

    #[error("message must not be empty")]
    EmptyMessage,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(
        &self,
        endpoint: &ProviderEndpoint,
        api_key: &str,
        request: GenerateRequest,
    ) -> Result<String, ProviderError>;

    async fn stream(
        &self,
        endpoint: &ProviderEndpoint,
        api_key: &str,
        request: GenerateRequest,
    ) -> Result<TextStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_names() {
        assert_eq!("OpenAI".parse::<ProviderId>().expect("openai"), ProviderId::OpenAi);
        assert_eq!("google".parse::<ProviderId>().expect("google"), ProviderId::Gemini);
        assert!(matches!(
            "mistral".parse::<ProviderId>(),
            Err(ChatError::UnknownProvider(name)) if name == "mistral"
        ));
    }

    #[test]
    fn provider_wire_names() {
        let text = serde_json::to_string(&ProviderId::OpenAi).expect("serialize");
        assert_eq!(text, "\"openai\"");
        let parsed: ProviderId = serde_json::from_str("\"google\"").expect("alias");
        assert_eq!(parsed, ProviderId::Gemini);
    }

    #[test]
    fn splits_system_prompt_from_conversation() {
        let request = GenerateRequest {
            model: "m".to_string(),
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            params: GenerationParams::default(),
        };
        assert_eq!(request.system_prompt().as_deref(), Some("be brief"));
        assert_eq!(request.conversation().count(), 2);
    }

    #[test]
    fn provider_error_display_includes_kind() {
        let err = ProviderError::new(ProviderErrorKind::RateLimited, "slow down");
        assert_eq!(err.to_string(), "rate limited: slow down");
    }
}
