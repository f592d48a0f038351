//! Error taxonomy for the proxy core.
//!
//! Every [`ProxyError`] maps to a wire-level `code` string and an HTTP
//! status, and declares whether the dispatcher may fall back to another
//! backend after it. Upstream non-2xx responses carry the upstream body so
//! the final attempt's payload can be propagated to the client verbatim.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;

/// Errors produced by the dispatch pipeline and its components.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The client request body could not be parsed or fails validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The client request body does not name a model.
    #[error("request body must include a model")]
    ModelRequired,

    /// Missing, unknown, or disabled API key.
    #[error("missing or invalid API key")]
    InvalidApiKey,

    /// The API key does not list the requested model.
    #[error("API key is not allowed to access model '{0}'")]
    ModelNotAllowed(String),

    /// No model with this name is configured.
    #[error("model '{0}' is not configured")]
    ModelNotFound(String),

    /// An explicitly requested backend does not exist under the model.
    #[error("backend '{0}' is not configured for this model")]
    BackendNotFound(String),

    /// An explicitly requested backend exists but is disabled.
    #[error("backend '{0}' is disabled")]
    BackendDisabled(String),

    /// The model has no selectable backend (all disabled or weight 0).
    #[error("no backend available for model '{0}'")]
    NoBackend(String),

    /// Every fallback candidate was at its concurrency cap.
    #[error("all backends are at capacity")]
    AllBackendsAtCapacity,

    /// Transport-level failure talking to an upstream.
    #[error("upstream request failed: {0}")]
    Network(String),

    /// The upstream answered with a non-2xx status. The status and body are
    /// propagated to the client when this is the final attempt.
    #[error("upstream returned HTTP {status}")]
    UpstreamHttp {
        status: u16,
        body: Bytes,
        content_type: Option<HeaderValue>,
    },

    /// The upstream did not produce its first byte within the TTFT deadline.
    #[error("upstream did not respond within the TTFT deadline")]
    TtftTimeout,

    /// The stream broke after bytes were already delivered to the client.
    /// Never becomes a client response; recorded as a metric only.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Invalid configuration detected at startup or on mutation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A durable store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Catch-all for internal failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Wire-level `code` string for the error body.
    pub fn code(&self) -> String {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request".into(),
            ProxyError::ModelRequired => "model_required".into(),
            ProxyError::InvalidApiKey => "invalid_api_key".into(),
            ProxyError::ModelNotAllowed(_) => "model_not_allowed".into(),
            ProxyError::ModelNotFound(_) => "model_not_found".into(),
            ProxyError::BackendNotFound(_) => "backend_not_found".into(),
            ProxyError::BackendDisabled(_) => "backend_disabled".into(),
            ProxyError::NoBackend(_) => "no_backend".into(),
            ProxyError::AllBackendsAtCapacity => "all_backends_at_capacity".into(),
            ProxyError::Network(_) => "network_error".into(),
            ProxyError::UpstreamHttp { status, .. } => format!("http_{status}"),
            ProxyError::TtftTimeout => "ttft_timeout".into(),
            ProxyError::StreamInterrupted(_) => "stream_interrupted".into(),
            ProxyError::InvalidConfig(_) => "invalid_config".into(),
            ProxyError::Storage(_) => "storage_error".into(),
            ProxyError::Internal(_) => "internal_error".into(),
        }
    }

    /// HTTP status returned to the client when this error is final.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::ModelRequired => StatusCode::BAD_REQUEST,
            ProxyError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::ModelNotFound(_)
            | ProxyError::BackendNotFound(_)
            | ProxyError::BackendDisabled(_)
            | ProxyError::NoBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AllBackendsAtCapacity => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::TtftTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Network(_)
            | ProxyError::StreamInterrupted(_)
            | ProxyError::InvalidConfig(_)
            | ProxyError::Storage(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatcher may try the next fallback candidate after this
    /// failure. Client-input and authorization errors short-circuit.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            ProxyError::AllBackendsAtCapacity
                | ProxyError::Network(_)
                | ProxyError::UpstreamHttp { .. }
                | ProxyError::TtftTimeout
        )
    }

    /// OpenAI-style `type` label for the error body.
    fn type_label(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::FORBIDDEN => "permission_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            _ => "api_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        // Final upstream failures propagate the upstream payload untouched.
        if let ProxyError::UpstreamHttp {
            status,
            body,
            content_type,
        } = self
        {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(axum::body::Body::from(body));
            *response.status_mut() = status;
            if let Some(ct) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, ct);
            }
            return response;
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.type_label(),
                "code": self.code(),
            }
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
