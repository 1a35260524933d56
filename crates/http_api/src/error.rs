use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use core_types::{ChatError, ProviderErrorKind};
use serde_json::json;

/// A [`ChatError`] rendered as `{"detail": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::UnknownProvider(_)
            | ChatError::InvalidModel { .. }
            | ChatError::MissingApiKey(_)
            | ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::Provider(err) => match err.kind {
                ProviderErrorKind::AuthFailure => StatusCode::UNAUTHORIZED,
                ProviderErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ProviderErrorKind::InvalidModel => StatusCode::BAD_REQUEST,
                ProviderErrorKind::NetworkError
                | ProviderErrorKind::Upstream
                | ProviderErrorKind::MalformedResponse => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, "request failed: {}", self.0);
        } else {
            tracing::debug!(%status, "request rejected: {}", self.0);
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}
