use std::sync::Arc;

use async_stream::try_stream;
use config::ModelRegistry;
use conversation_store::{ConversationStore, SessionConfig, SessionGuard, SessionSnapshot};
use core_types::{
    ChatError, GenerateRequest, ProviderAdapter, ProviderEndpoint, ProviderError, ProviderId,
    Role, SessionId, TextStream, Turn,
};
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ConfigureSession {
    pub session_id: SessionId,
    pub provider: ProviderId,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl ConfigureSession {
    pub fn new(session_id: impl Into<SessionId>, provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            provider,
            model: model.into(),
            api_key: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Runs one user turn at a time per session against the configured provider.
pub struct SessionDispatcher {
    store: Arc<ConversationStore>,
    provider: Arc<dyn ProviderAdapter>,
    registry: Arc<ModelRegistry>,
}

impl SessionDispatcher {
    pub fn new(
        store: Arc<ConversationStore>,
        provider: Arc<dyn ProviderAdapter>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn list_models(&self) -> IndexMap<ProviderId, Vec<String>> {
        self.registry.list()
    }

    /// Validates and stores the session configuration. An empty model falls
    /// back to the provider's default model; the resolved model is returned.
    pub fn configure(&self, request: ConfigureSession) -> Result<String, ChatError> {
        let model = match request.model.trim() {
            "" => self
                .registry
                .get(request.provider)
                .map(|entry| entry.default_model.clone())
                .ok_or_else(|| ChatError::UnknownProvider(request.provider.to_string()))?,
            name => name.to_string(),
        };
        let entry = self.registry.validate(request.provider, &model)?;

        let api_key = request
            .api_key
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                entry
                    .api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
                    .filter(|key| !key.trim().is_empty())
            })
            .ok_or(ChatError::MissingApiKey(request.provider))?;

        let system_prompt = match request.system_prompt {
            Some(prompt) => Some(prompt),
            None => Some(self.registry.default_system_prompt().to_string()),
        }
        .filter(|prompt| !prompt.trim().is_empty());

        let mut params = entry.params;
        if let Some(temperature) = request.temperature {
            params.temperature = temperature;
        }
        if request.max_tokens.is_some() {
            params.max_tokens = request.max_tokens;
        }
        if request.top_p.is_some() {
            params.top_p = request.top_p;
        }

        self.store.configure(
            request.session_id,
            SessionConfig {
                provider: request.provider,
                model: model.clone(),
                system_prompt,
                params,
                api_key,
            },
        );
        Ok(model)
    }

    pub async fn send_message(&self, session_id: &str, user_text: &str) -> Result<String, ChatError> {
        let (guard, endpoint, config, request) = self.begin_exchange(session_id, user_text).await?;

        let reply = self
            .provider
            .generate(&endpoint, &config.api_key, request)
            .await
            .inspect_err(|err| {
                warn!(session_id, provider = %config.provider, "provider call failed: {err}");
            })?;

        let turn = guard.append(Role::Assistant, reply.clone());
        debug!(session_id, ordinal = turn.ordinal, "reply recorded");
        Ok(reply)
    }

    /// Streams the reply. The session stays locked until the returned stream
    /// is exhausted or dropped, and the assistant turn is recorded only when
    /// the provider stream completes.
    pub async fn send_message_streaming(
        &self,
        session_id: &str,
        user_text: &str,
    ) -> Result<TextStream, ChatError> {
        let (guard, endpoint, config, request) = self.begin_exchange(session_id, user_text).await?;

        let upstream = self
            .provider
            .stream(&endpoint, &config.api_key, request)
            .await
            .inspect_err(|err| {
                warn!(session_id, provider = %config.provider, "provider stream failed to start: {err}");
            })?;

        Ok(Box::pin(record_reply(
            PendingReply {
                guard,
                text: String::new(),
                committed: false,
            },
            upstream,
        )))
    }

    pub async fn reset(&self, session_id: &str) -> Result<(), ChatError> {
        let guard = self.store.lock(session_id).await?;
        guard.reset();
        Ok(())
    }

    pub fn transcript(&self, session_id: &str) -> Result<Vec<Turn>, ChatError> {
        self.store.get_transcript(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, ChatError> {
        self.store.snapshot(session_id)
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.store.remove(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids = self.store.session_ids();
        ids.sort();
        ids
    }

    async fn begin_exchange(
        &self,
        session_id: &str,
        user_text: &str,
    ) -> Result<(SessionGuard, ProviderEndpoint, SessionConfig, GenerateRequest), ChatError> {
        let guard = self.store.lock(session_id).await?;
        if user_text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let config = guard.config();
        let endpoint = self
            .registry
            .get(config.provider)
            .map(|entry| entry.endpoint.clone())
            .ok_or_else(|| ChatError::UnknownProvider(config.provider.to_string()))?;

        let turn = guard.append(Role::User, user_text);
        info!(
            session_id,
            provider = %config.provider,
            model = %config.model,
            ordinal = turn.ordinal,
            "dispatching user turn"
        );

        let request = GenerateRequest {
            model: config.model.clone(),
            messages: guard.messages(),
            params: config.params,
        };
        Ok((guard, endpoint, config, request))
    }
}

struct PendingReply {
    guard: SessionGuard,
    text: String,
    committed: bool,
}

impl PendingReply {
    fn commit(&mut self) -> Turn {
        self.committed = true;
        self.guard
            .append(Role::Assistant, std::mem::take(&mut self.text))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.committed {
            warn!(
                session_id = self.guard.session_id(),
                received = self.text.len(),
                "reply stream ended early, no assistant turn recorded"
            );
        }
    }
}

fn record_reply(
    mut pending: PendingReply,
    mut upstream: TextStream,
) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static {
    try_stream! {
        while let Some(fragment) = upstream.next().await {
            let fragment = fragment?;
            pending.text.push_str(&fragment);
            yield fragment;
        }
        let turn = pending.commit();
        debug!(
            session_id = pending.guard.session_id(),
            ordinal = turn.ordinal,
            "streamed reply recorded"
        );
    }
}
