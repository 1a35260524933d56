use core_types::{GenerateRequest, MessageRole, ProviderEndpoint, ProviderError, ProviderErrorKind};
use reqwest::header::{HeaderMap, HeaderName};
use serde_json::{Map, Value, json};

use crate::{StreamEvent, header_value, upstream_error};

pub(crate) fn url(endpoint: &ProviderEndpoint, model: &str, stream: bool) -> String {
    let base = endpoint.base_url.trim_end_matches('/');
    if stream {
        format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1beta/models/{model}:generateContent")
    }
}

pub(crate) fn headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("x-goog-api-key"), header_value(api_key)?);
    Ok(headers)
}

pub(crate) fn body(request: &GenerateRequest) -> Value {
    let contents: Vec<Value> = request
        .conversation()
        .map(|msg| {
            let role = if msg.role == MessageRole::Assistant {
                "model"
            } else {
                "user"
            };
            json!({"role": role, "parts": [{"text": msg.content}]})
        })
        .collect();

    let mut generation = Map::new();
    generation.insert("temperature".to_string(), json!(request.params.temperature));
    if let Some(top_p) = request.params.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.params.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system) = request.system_prompt() {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }
    body.insert("generationConfig".to_string(), Value::Object(generation));
    Value::Object(body)
}

pub(crate) fn parse_reply(payload: &Value) -> Result<String, ProviderError> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    let Some(candidates) = payload.get("candidates").and_then(Value::as_array) else {
        return Err(blocked_or_malformed(payload));
    };
    Ok(candidate_text(candidates))
}

pub(crate) fn parse_stream_event(payload: &Value) -> Result<StreamEvent, ProviderError> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    let text = payload
        .get("candidates")
        .and_then(Value::as_array)
        .map(|candidates| candidate_text(candidates))
        .unwrap_or_default();
    if text.is_empty() {
        Ok(StreamEvent::Ignore)
    } else {
        Ok(StreamEvent::Delta(text))
    }
}

fn candidate_text(candidates: &[Value]) -> String {
    candidates
        .iter()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(Value::as_array)
        })
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

fn blocked_or_malformed(payload: &Value) -> ProviderError {
    match payload
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
    {
        Some(reason) => ProviderError::new(
            ProviderErrorKind::Upstream,
            format!("prompt blocked: {reason}"),
        ),
        None => ProviderError::malformed("gemini reply has no candidates"),
    }
}
