use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use core_types::{
    GenerateRequest, ProviderAdapter, ProviderEndpoint, ProviderError, ProviderErrorKind,
    ProviderId, TextStream,
};
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

mod anthropic;
mod gemini;
mod openai;
mod sse;

use sse::SseDecoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    Delta(String),
    Done,
    Ignore,
}

pub struct HttpProviderAdapter {
    client: reqwest::Client,
}

impl Default for HttpProviderAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProviderAdapter {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn generate(
        &self,
        endpoint: &ProviderEndpoint,
        api_key: &str,
        request: GenerateRequest,
    ) -> Result<String, ProviderError> {
        let response = self.send(endpoint, api_key, &request, false).await?;
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::network(format!("failed to read reply: {err}")))?;
        let payload: Value = serde_json::from_str(&text)
            .map_err(|err| ProviderError::malformed(format!("reply is not json: {err}")))?;
        parse_reply(endpoint.id, &payload)
    }

    async fn stream(
        &self,
        endpoint: &ProviderEndpoint,
        api_key: &str,
        request: GenerateRequest,
    ) -> Result<TextStream, ProviderError> {
        let response = self.send(endpoint, api_key, &request, true).await?;
        Ok(Box::pin(fragments(endpoint.id, response)))
    }
}

impl HttpProviderAdapter {
    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        api_key: &str,
        request: &GenerateRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ProviderError::auth(format!(
                "no api key for provider {}",
                endpoint.id
            )));
        }

        let model = request.model.trim();
        let (url, mut headers, body) = match endpoint.id {
            ProviderId::OpenAi => (
                openai::url(endpoint),
                openai::headers(api_key)?,
                openai::body(request, stream),
            ),
            ProviderId::Anthropic => (
                anthropic::url(endpoint),
                anthropic::headers(api_key)?,
                anthropic::body(request, stream),
            ),
            ProviderId::Gemini => {
                if model.is_empty() {
                    return Err(ProviderError::new(
                        ProviderErrorKind::InvalidModel,
                        "gemini model is required",
                    ));
                }
                (
                    gemini::url(endpoint, model, stream),
                    gemini::headers(api_key)?,
                    gemini::body(request),
                )
            }
        };
        apply_extra_headers(&mut headers, &endpoint.extra_headers)?;
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };

        let mut builder = self
            .client
            .post(&url)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .json(&body);
        // reqwest timeouts cover the whole body, which would cut long streams
        if let (false, Some(secs)) = (stream, endpoint.request_timeout_secs) {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        debug!(provider = %endpoint.id, model, stream, "sending provider request");
        let response = builder.send().await.map_err(|err| {
            warn!(provider = %endpoint.id, "provider request failed: {err}");
            ProviderError::network(err.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status, &text);
            warn!(provider = %endpoint.id, %status, kind = ?err.kind, "provider rejected request");
            return Err(err);
        }
        Ok(response)
    }
}

fn fragments(
    provider: ProviderId,
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut finished = false;
        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| {
                ProviderError::network(format!("stream interrupted: {err}"))
            })?;
            for data in decoder.feed(&chunk) {
                match parse_stream_data(provider, &data)? {
                    StreamEvent::Delta(text) => yield text,
                    StreamEvent::Done => {
                        finished = true;
                        break 'read;
                    }
                    StreamEvent::Ignore => {}
                }
            }
        }
        if !finished {
            if let Some(data) = decoder.finish() {
                match parse_stream_data(provider, &data)? {
                    StreamEvent::Delta(text) => yield text,
                    StreamEvent::Done => finished = true,
                    StreamEvent::Ignore => {}
                }
            }
        }
        // gemini has no terminal event, the body closing is its end marker
        if !finished && provider != ProviderId::Gemini {
            warn!(provider = %provider, "provider stream closed before its end marker");
            Err::<(), _>(ProviderError::network("stream ended before completion"))?;
        }
        debug!(provider = %provider, "provider stream finished");
    }
}

fn parse_stream_data(provider: ProviderId, data: &str) -> Result<StreamEvent, ProviderError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(StreamEvent::Ignore);
    }
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let payload: Value = serde_json::from_str(data)
        .map_err(|err| ProviderError::malformed(format!("bad stream payload: {err}")))?;
    match provider {
        ProviderId::OpenAi => openai::parse_stream_event(&payload),
        ProviderId::Anthropic => anthropic::parse_stream_event(&payload),
        ProviderId::Gemini => gemini::parse_stream_event(&payload),
    }
}

fn parse_reply(provider: ProviderId, payload: &Value) -> Result<String, ProviderError> {
    match provider {
        ProviderId::OpenAi => openai::parse_reply(payload),
        ProviderId::Anthropic => anthropic::parse_reply(payload),
        ProviderId::Gemini => gemini::parse_reply(payload),
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = error_message(body).unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            status.to_string()
        } else {
            trimmed.chars().take(512).collect()
        }
    });
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorKind::AuthFailure,
        StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimited,
        StatusCode::NOT_FOUND => ProviderErrorKind::InvalidModel,
        StatusCode::BAD_REQUEST if message.to_ascii_lowercase().contains("model") => {
            ProviderErrorKind::InvalidModel
        }
        _ => ProviderErrorKind::Upstream,
    };
    ProviderError::new(kind, message)
}

fn error_message(body: &str) -> Option<String> {
    let payload: Value = serde_json::from_str(body).ok()?;
    payload
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// An `error` object inside an otherwise successful payload.
pub(crate) fn upstream_error(payload: &Value) -> Option<ProviderError> {
    let error = payload.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("provider returned an error");
    Some(ProviderError::new(ProviderErrorKind::Upstream, message))
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, ProviderError> {
    HeaderValue::from_str(value)
        .map_err(|_| ProviderError::auth("api key contains characters not allowed in headers"))
}

fn apply_extra_headers(
    headers: &mut HeaderMap,
    extra_headers: &[(String, String)],
) -> Result<(), ProviderError> {
    for (key, value) in extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            ProviderError::new(ProviderErrorKind::Upstream, format!("invalid header name: {key}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            ProviderError::new(
                ProviderErrorKind::Upstream,
                format!("invalid header value for {key}"),
            )
        })?;
        headers.insert(name, value);
    }
    Ok(())
}
