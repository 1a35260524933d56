use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use core_types::{
    ChatError, ChatMessage, GenerationParams, ProviderId, Role, SessionId, Turn,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Mutex as ExchangeLock, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Clone, PartialEq)]
pub struct SessionConfig {
    pub provider: ProviderId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
    pub api_key: String,
}

// api keys never reach the logs
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("params", &self.params)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub provider: ProviderId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
}

#[derive(Debug)]
struct SessionState {
    config: SessionConfig,
    transcript: Vec<Turn>,
}

impl SessionState {
    fn push(&mut self, role: Role, content: String) -> Turn {
        let turn = Turn {
            ordinal: self.transcript.len(),
            role,
            content,
            created_at: Utc::now(),
        };
        self.transcript.push(turn.clone());
        turn
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.transcript.len() + 1);
        if let Some(prompt) = self.config.system_prompt.as_deref() {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(self.transcript.iter().map(ChatMessage::from));
        messages
    }
}

struct Slot {
    id: SessionId,
    exchange: Arc<ExchangeLock<()>>,
    state: Mutex<SessionState>,
}

/// In-memory transcripts keyed by session id.
///
/// Reads and single appends only take the slot's state lock, which is never
/// held across an `.await`. Whole exchanges are serialized per session
/// through [`ConversationStore::lock`].
#[derive(Default)]
pub struct ConversationStore {
    sessions: RwLock<HashMap<SessionId, Arc<Slot>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the session or replaces its configuration. The transcript
    /// always starts empty; an exchange still running against the previous
    /// configuration keeps writing to the detached slot.
    pub fn configure(&self, session_id: impl Into<SessionId>, config: SessionConfig) {
        let id = session_id.into();
        info!(
            session_id = %id,
            provider = %config.provider,
            model = %config.model,
            "session configured"
        );
        let slot = Arc::new(Slot {
            id: id.clone(),
            exchange: Arc::new(ExchangeLock::new(())),
            state: Mutex::new(SessionState {
                config,
                transcript: Vec::new(),
            }),
        });
        self.sessions.write().insert(id, slot);
    }

    pub fn append(
        &self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Turn, ChatError> {
        let slot = self.slot(session_id)?;
        let turn = slot.state.lock().push(role, content.into());
        Ok(turn)
    }

    pub fn get_transcript(&self, session_id: &str) -> Result<Vec<Turn>, ChatError> {
        let slot = self.slot(session_id)?;
        let transcript = slot.state.lock().transcript.clone();
        Ok(transcript)
    }

    /// Clears the transcript without waiting for an in-flight exchange; use
    /// [`SessionGuard::reset`] to serialize with chats.
    pub fn reset(&self, session_id: &str) -> Result<(), ChatError> {
        let slot = self.slot(session_id)?;
        slot.state.lock().transcript.clear();
        info!(session_id, "session transcript reset");
        Ok(())
    }

    pub fn config(&self, session_id: &str) -> Result<SessionConfig, ChatError> {
        let slot = self.slot(session_id)?;
        let config = slot.state.lock().config.clone();
        Ok(config)
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, ChatError> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock();
        Ok(SessionSnapshot {
            session_id: slot.id.clone(),
            provider: state.config.provider,
            model: state.config.model.clone(),
            system_prompt: state.config.system_prompt.clone(),
            turns: state.transcript.clone(),
        })
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            info!(session_id, "session removed");
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Waits until no other exchange holds the session, then returns an
    /// exclusive handle. The handle keeps the session locked until dropped.
    pub async fn lock(&self, session_id: &str) -> Result<SessionGuard, ChatError> {
        let slot = self.slot(session_id)?;
        let exchange = Arc::clone(&slot.exchange).lock_owned().await;
        debug!(session_id, "session lock acquired");
        Ok(SessionGuard {
            slot,
            _exchange: exchange,
        })
    }

    fn slot(&self, session_id: &str) -> Result<Arc<Slot>, ChatError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }
}

pub struct SessionGuard {
    slot: Arc<Slot>,
    _exchange: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.slot.id
    }

    pub fn config(&self) -> SessionConfig {
        self.slot.state.lock().config.clone()
    }

    pub fn append(&self, role: Role, content: impl Into<String>) -> Turn {
        self.slot.state.lock().push(role, content.into())
    }

    pub fn transcript(&self) -> Vec<Turn> {
        self.slot.state.lock().transcript.clone()
    }

    /// System prompt followed by the transcript, ready for a provider call.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.slot.state.lock().messages()
    }

    pub fn reset(&self) {
        self.slot.state.lock().transcript.clear();
        info!(session_id = %self.slot.id, "session transcript reset");
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session_id", &self.slot.id)
            .finish()
    }
}
