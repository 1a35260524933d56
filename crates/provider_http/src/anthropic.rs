use core_types::{
    GenerateRequest, MessageRole, ProviderEndpoint, ProviderError, ProviderErrorKind,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value, json};

use crate::{StreamEvent, header_value};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) fn url(endpoint: &ProviderEndpoint) -> String {
    format!("{}/v1/messages", endpoint.base_url.trim_end_matches('/'))
}

pub(crate) fn headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("x-api-key"), header_value(api_key)?);
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(API_VERSION),
    );
    Ok(headers)
}

pub(crate) fn body(request: &GenerateRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .conversation()
        .map(|msg| {
            let role = if msg.role == MessageRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            json!({"role": role, "content": msg.content})
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert(
        "max_tokens".to_string(),
        json!(request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    if let Some(system) = request.system_prompt() {
        body.insert("system".to_string(), json!(system));
    }
    body.insert("temperature".to_string(), json!(request.params.temperature));
    if let Some(top_p) = request.params.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    body.insert("stream".to_string(), json!(stream));
    Value::Object(body)
}

pub(crate) fn parse_reply(payload: &Value) -> Result<String, ProviderError> {
    if payload.get("type").and_then(Value::as_str) == Some("error") {
        return Err(error_event(payload));
    }
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::malformed("anthropic reply has no content blocks"))?;
    Ok(blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect())
}

pub(crate) fn parse_stream_event(payload: &Value) -> Result<StreamEvent, ProviderError> {
    match payload.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => Ok(payload
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map_or(StreamEvent::Ignore, |text| {
                StreamEvent::Delta(text.to_string())
            })),
        Some("message_stop") => Ok(StreamEvent::Done),
        Some("error") => Err(error_event(payload)),
        _ => Ok(StreamEvent::Ignore),
    }
}

fn error_event(payload: &Value) -> ProviderError {
    let error = payload.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("anthropic error");
    let kind = match error.and_then(|e| e.get("type")).and_then(Value::as_str) {
        Some("authentication_error" | "permission_error") => ProviderErrorKind::AuthFailure,
        Some("rate_limit_error" | "overloaded_error") => ProviderErrorKind::RateLimited,
        Some("not_found_error") => ProviderErrorKind::InvalidModel,
        _ => ProviderErrorKind::Upstream,
    };
    ProviderError::new(kind, message)
}
