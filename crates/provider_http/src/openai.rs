use core_types::{GenerateRequest, MessageRole, ProviderEndpoint, ProviderError};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde_json::{Map, Value, json};

use crate::{StreamEvent, header_value, upstream_error};

pub(crate) fn url(endpoint: &ProviderEndpoint) -> String {
    format!(
        "{}/chat/completions",
        endpoint.base_url.trim_end_matches('/')
    )
}

pub(crate) fn headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {api_key}"))?);
    Ok(headers)
}

pub(crate) fn body(request: &GenerateRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            json!({"role": role, "content": msg.content})
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("temperature".to_string(), json!(request.params.temperature));
    if let Some(top_p) = request.params.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.params.max_tokens {
        body.insert("max_completion_tokens".to_string(), json!(max_tokens));
    }
    body.insert("stream".to_string(), json!(stream));
    Value::Object(body)
}

pub(crate) fn parse_reply(payload: &Value) -> Result<String, ProviderError> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ProviderError::malformed("openai reply has no message content"))
}

pub(crate) fn parse_stream_event(payload: &Value) -> Result<StreamEvent, ProviderError> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    let mut text = String::new();
    if let Some(choices) = payload.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(delta) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                text.push_str(delta);
            }
        }
    }
    if text.is_empty() {
        Ok(StreamEvent::Ignore)
    } else {
        Ok(StreamEvent::Delta(text))
    }
}

#[cfg(test)]
mod tests {
    use core_types::{ChatMessage, GenerationParams, ProviderErrorKind};

    use super::*;

    #[test]
    fn builds_chat_completion_body() {
        let request = GenerateRequest {
            model: "gpt-x".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            params: GenerationParams {
                temperature: 0.2,
                max_tokens: Some(64),
                top_p: None,
            },
        };
        let body = body(&request, true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_completion_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn extracts_reply_text() {
        let payload = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(parse_reply(&payload).expect("reply"), "hello");
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = parse_reply(&json!({"choices": []})).expect_err("must fail");
        assert_eq!(err.kind, ProviderErrorKind::MalformedResponse);
    }

    #[test]
    fn maps_delta_chunks() {
        let payload = json!({"choices": [{"delta": {"content": "Hel"}}]});
        assert_eq!(
            parse_stream_event(&payload).expect("event"),
            StreamEvent::Delta("Hel".to_string())
        );
        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(parse_stream_event(&role_only).expect("event"), StreamEvent::Ignore);
    }
}
