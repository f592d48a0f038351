//! Adapter for OpenAI-compatible chat-completion APIs.
//!
//! Covers OpenAI itself plus the long tail of compatible servers (vLLM,
//! Together, Groq, Mistral, Fireworks, llama.cpp server, ...).
//!
//! Endpoint: `{backend.url}/v1/chat/completions`. Streaming responses are
//! text SSE, forwarded as-is.

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use serde_json::Value;

use super::{ProviderAdapter, StandardizedRequest};
use crate::error::{ProxyError, Result};
use crate::types::{BackendConfig, ProviderKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn validate(&self, body: &Value) -> Result<()> {
        let object = body
            .as_object()
            .ok_or_else(|| ProxyError::InvalidRequest("body must be a JSON object".into()))?;
        match object.get("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => Ok(()),
            Some(_) => Err(ProxyError::InvalidRequest(
                "'messages' must be a non-empty array".into(),
            )),
            None => Err(ProxyError::InvalidRequest("'messages' is required".into())),
        }
    }

    fn parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        _path_model: Option<&str>,
        force_stream: bool,
    ) -> Result<StandardizedRequest> {
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| ProxyError::InvalidRequest(format!("body is not valid JSON: {e}")))?;
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or(ProxyError::ModelRequired)?
            .to_string();
        let stream = force_stream
            || body
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        Ok(StandardizedRequest {
            model,
            stream,
            original_headers: headers.clone(),
            original_body: body,
        })
    }

    fn target_url(&self, backend: &BackendConfig, _request: &StandardizedRequest) -> Result<String> {
        let base = backend.url.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!("backend '{}' has no url", backend.id))
        })?;
        Ok(format!(
            "{}/v1/chat/completions",
            base.trim_end_matches('/')
        ))
    }

    fn prepare_body(
        &self,
        request: &StandardizedRequest,
        backend: &BackendConfig,
    ) -> Result<Vec<u8>> {
        let mut body = request.original_body.clone();
        if let Some(override_model) = &backend.model {
            body["model"] = Value::String(override_model.clone());
        }
        serde_json::to_vec(&body).map_err(|e| ProxyError::Internal(e.to_string()))
    }

    fn prepare_headers(
        &self,
        backend: &BackendConfig,
        stream: bool,
        _url: &str,
        _incoming: &HeaderMap,
        _body: &[u8],
    ) -> Result<HeaderMap> {
        let api_key = backend.api_key.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!("backend '{}' has no api_key", backend.id))
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProxyError::InvalidConfig(format!("backend '{}' api_key", backend.id)))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn uses_binary_stream(&self) -> bool {
        false
    }
}
