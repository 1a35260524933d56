//! HTTP surface: JSON endpoints for configuring sessions and chatting, plus an
//! SSE endpoint that forwards reply fragments as they arrive.

mod error;

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{delete, get, post},
};
use conversation_store::SessionSnapshot;
use core_dispatcher::{ConfigureSession, SessionDispatcher};
use core_types::{ProviderId, SessionId};
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

pub use error::ApiError;

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<SessionDispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<SessionDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub provider: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct ConfigureResponse {
    pub status: &'static str,
    pub message: String,
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub session_id: SessionId,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub session_id: SessionId,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionId>,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub providers: Vec<ProviderId>,
    pub models: IndexMap<ProviderId, Vec<String>>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/models", get(list_models))
        .route("/configure", post(configure))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/reset", post(reset))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/transcript", get(transcript))
        .route("/sessions/{id}", delete(remove_session));

    Router::new()
        .route("/", get(root))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "chatrelay API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.dispatcher.list_models();
    Json(ModelsResponse {
        providers: models.keys().copied().collect(),
        models,
    })
}

async fn configure(
    State(state): State<AppState>,
    Json(request): Json<ConfigureRequest>,
) -> Result<Json<ConfigureResponse>, ApiError> {
    let provider: ProviderId = request.provider.parse()?;
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let model = state.dispatcher.configure(ConfigureSession {
        session_id: session_id.clone(),
        provider,
        model: request.model_name,
        api_key: request.api_key,
        system_prompt: request.system_prompt,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
    })?;

    Ok(Json(ConfigureResponse {
        status: "success",
        message: format!("Configured {provider} model: {model}"),
        session_id,
    }))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let response = state
        .dispatcher
        .send_message(&request.session_id, &request.message)
        .await?;
    Ok(Json(MessageResponse {
        session_id: request.session_id,
        response,
    }))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut fragments = state
        .dispatcher
        .send_message_streaming(&request.session_id, &request.message)
        .await?;

    let events = stream! {
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => yield Ok(Event::default().data(event_data(&fragment))),
                Err(err) => {
                    yield Ok(Event::default().event("error").data(event_data(&err.to_string())));
                    return;
                }
            }
        }
        yield Ok(Event::default().data(DONE_MARKER));
    };
    Ok(Sse::new(events))
}

async fn reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.dispatcher.reset(&request.session_id).await?;
    Ok(Json(StatusResponse {
        status: "success",
        message: "Conversation reset".to_string(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.dispatcher.session_ids(),
    })
}

async fn transcript(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.dispatcher.snapshot(&id)?))
}

async fn remove_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    if state.dispatcher.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(core_types::ChatError::SessionNotFound(id).into())
    }
}

// SSE data lines cannot carry carriage returns; newlines are split into
// multiple `data:` lines by the encoder.
fn event_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use config::{AppConfig, ModelRegistry};
    use conversation_store::ConversationStore;
    use core_types::{
        GenerateRequest, MessageRole, ProviderAdapter, ProviderEndpoint, ProviderError,
        ProviderErrorKind, TextStream,
    };

    use super::*;

    struct EchoAdapter {
        fail_with: Option<ProviderErrorKind>,
    }

    fn last_user(request: &GenerateRequest) -> String {
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        async fn generate(
            &self,
            _endpoint: &ProviderEndpoint,
            _api_key: &str,
            request: GenerateRequest,
        ) -> Result<String, ProviderError> {
            match self.fail_with {
                Some(kind) => Err(ProviderError::new(kind, "scripted failure")),
                None => Ok(format!("echo: {}", last_user(&request))),
            }
        }

        async fn stream(
            &self,
            _endpoint: &ProviderEndpoint,
            _api_key: &str,
            request: GenerateRequest,
        ) -> Result<TextStream, ProviderError> {
            let text = last_user(&request);
            let mut items = vec![Ok("echo: ".to_string()), Ok(text)];
            if let Some(kind) = self.fail_with {
                items.push(Err(ProviderError::new(kind, "scripted failure")));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    async fn spawn_server(fail_with: Option<ProviderErrorKind>) -> (String, Arc<SessionDispatcher>) {
        let dispatcher = Arc::new(SessionDispatcher::new(
            Arc::new(ConversationStore::new()),
            Arc::new(EchoAdapter { fail_with }),
            Arc::new(ModelRegistry::from_config(&AppConfig::default())),
        ));
        let app = router(AppState::new(dispatcher.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}"), dispatcher)
    }

    async fn configure(client: &reqwest::Client, base: &str, session_id: Option<&str>) -> Value {
        let mut body = json!({
            "provider": "openai",
            "model_name": "gpt-4-0613",
            "api_key": "sk-test",
        });
        if let Some(id) = session_id {
            body["session_id"] = json!(id);
        }
        let response = client
            .post(format!("{base}/api/configure"))
            .json(&body)
            .send()
            .await
            .expect("configure request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("configure json")
    }

    #[test]
    fn strips_carriage_returns() {
        assert_eq!(event_data("a\r\nb\rc"), "a\nb\nc");
    }

    #[tokio::test]
    async fn configure_generates_session_id() {
        let (base, _) = spawn_server(None).await;
        let client = reqwest::Client::new();

        let body = configure(&client, &base, None).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Configured openai model: gpt-4-0613");
        let id = body["session_id"].as_str().expect("session id");
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn chat_round_trip_and_transcript() {
        let (base, _) = spawn_server(None).await;
        let client = reqwest::Client::new();
        configure(&client, &base, Some("s1")).await;

        let reply: Value = client
            .post(format!("{base}/api/chat"))
            .json(&json!({"session_id": "s1", "message": "hi"}))
            .send()
            .await
            .expect("chat request")
            .json()
            .await
            .expect("chat json");
        assert_eq!(reply, json!({"session_id": "s1", "response": "echo: hi"}));

        let snapshot: Value = client
            .get(format!("{base}/api/sessions/s1/transcript"))
            .send()
            .await
            .expect("transcript request")
            .json()
            .await
            .expect("transcript json");
        assert_eq!(snapshot["provider"], "openai");
        assert_eq!(snapshot["turns"][0]["role"], "user");
        assert_eq!(snapshot["turns"][1]["content"], "echo: hi");
        assert_eq!(snapshot["turns"][1]["ordinal"], 1);
    }

    #[tokio::test]
    async fn errors_render_detail_with_status() {
        let (base, _) = spawn_server(None).await;
        let client = reqwest::Client::new();

        let missing = client
            .post(format!("{base}/api/chat"))
            .json(&json!({"session_id": "ghost", "message": "hi"}))
            .send()
            .await
            .expect("chat request");
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = missing.json().await.expect("error json");
        assert!(body["detail"].as_str().expect("detail").contains("ghost"));

        let invalid = client
            .post(format!("{base}/api/configure"))
            .json(&json!({"provider": "openai", "model_name": "nope", "api_key": "k"}))
            .send()
            .await
            .expect("configure request");
        assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

        let unknown = client
            .post(format!("{base}/api/configure"))
            .json(&json!({"provider": "mistral", "model_name": "x", "api_key": "k"}))
            .send()
            .await
            .expect("configure request");
        assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provider_failure_maps_status() {
        let (base, dispatcher) = spawn_server(Some(ProviderErrorKind::RateLimited)).await;
        let client = reqwest::Client::new();
        configure(&client, &base, Some("s1")).await;

        let response = client
            .post(format!("{base}/api/chat"))
            .json(&json!({"session_id": "s1", "message": "hi"}))
            .send()
            .await
            .expect("chat request");
        assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(dispatcher.transcript("s1").expect("transcript").len(), 1);
    }

    #[tokio::test]
    async fn stream_sends_fragments_then_done() {
        let (base, dispatcher) = spawn_server(None).await;
        let client = reqwest::Client::new();
        configure(&client, &base, Some("s1")).await;

        let response = client
            .post(format!("{base}/api/chat/stream"))
            .json(&json!({"session_id": "s1", "message": "hi"}))
            .send()
            .await
            .expect("stream request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let body = response.text().await.expect("stream body");
        assert!(body.contains("data: echo: \n\n"));
        assert!(body.contains("data: hi\n\n"));
        assert!(body.ends_with("data: [DONE]\n\n"));

        let turns = dispatcher.transcript("s1").expect("transcript");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "echo: hi");
    }

    #[tokio::test]
    async fn stream_failure_emits_error_event() {
        let (base, dispatcher) = spawn_server(Some(ProviderErrorKind::NetworkError)).await;
        let client = reqwest::Client::new();
        configure(&client, &base, Some("s1")).await;

        let body = client
            .post(format!("{base}/api/chat/stream"))
            .json(&json!({"session_id": "s1", "message": "hi"}))
            .send()
            .await
            .expect("stream request")
            .text()
            .await
            .expect("stream body");
        assert!(body.contains("event: error\n"));
        assert!(!body.contains(DONE_MARKER));
        assert_eq!(dispatcher.transcript("s1").expect("transcript").len(), 1);
    }

    #[tokio::test]
    async fn reset_and_remove() {
        let (base, _) = spawn_server(None).await;
        let client = reqwest::Client::new();
        configure(&client, &base, Some("s1")).await;

        let reset: Value = client
            .post(format!("{base}/api/reset"))
            .json(&json!({"session_id": "s1"}))
            .send()
            .await
            .expect("reset request")
            .json()
            .await
            .expect("reset json");
        assert_eq!(reset, json!({"status": "success", "message": "Conversation reset"}));

        let removed = client
            .delete(format!("{base}/api/sessions/s1"))
            .send()
            .await
            .expect("delete request");
        assert_eq!(removed.status(), reqwest::StatusCode::NO_CONTENT);

        let again = client
            .delete(format!("{base}/api/sessions/s1"))
            .send()
            .await
            .expect("delete request");
        assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_models_in_config_order() {
        let (base, _) = spawn_server(None).await;
        let body: Value = reqwest::get(format!("{base}/api/models"))
            .await
            .expect("models request")
            .json()
            .await
            .expect("models json");
        assert_eq!(body["providers"], json!(["openai", "anthropic", "gemini"]));
        assert_eq!(body["models"]["anthropic"][0], "claude-3-7-sonnet-20250219");
    }

    #[tokio::test]
    async fn preflight_allows_any_origin() {
        let (base, _) = spawn_server(None).await;
        let response = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{base}/api/chat"))
            .header(reqwest::header::ORIGIN, "http://localhost:3000")
            .header(reqwest::header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(reqwest::header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .send()
            .await
            .expect("preflight request");
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn configure_without_model_uses_default_and_lists_session() {
        let (base, _) = spawn_server(None).await;
        let client = reqwest::Client::new();
        let body: Value = client
            .post(format!("{base}/api/configure"))
            .json(&json!({"session_id": "s9", "provider": "google", "api_key": "k", "top_p": 0.8}))
            .send()
            .await
            .expect("configure request")
            .json()
            .await
            .expect("configure json");
        assert_eq!(body["message"], "Configured gemini model: gemini-2.0-flash-lite");
        configure(&client, &base, Some("s1")).await;

        let sessions: Value = client
            .get(format!("{base}/api/sessions"))
            .send()
            .await
            .expect("sessions request")
            .json()
            .await
            .expect("sessions json");
        assert_eq!(sessions, json!({"sessions": ["s1", "s9"]}));
    }
}
