//! Provider adapters: per-provider request preparation and chunk framing.
//!
//! The [`ProviderAdapter`] trait abstracts over upstream API families,
//! translating a client request into the provider-specific URL, headers, and
//! body, and describing how response chunks are framed (text SSE vs binary
//! event stream). Built-in implementations: [`OpenAiAdapter`],
//! [`BedrockAdapter`].
//!
//! ## Architecture
//!
//! ```text
//! ingress bytes ──► parse() ──► StandardizedRequest ──► target_url()
//!                                                       prepare_headers()
//!                                                       prepare_body()
//!                                       │
//!                            ┌──────────┴──────────┐
//!                       OpenAiAdapter         BedrockAdapter
//!                    /v1/chat/completions   /model/{id}/invoke[-with-
//!                    Bearer auth, text SSE   response-stream], SigV4,
//!                                            binary event stream
//! ```

pub mod bedrock;
pub mod openai;

pub use bedrock::BedrockAdapter;
pub use openai::OpenAiAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::HeaderMap;

use crate::error::Result;
use crate::streaming::Chunk;
use crate::types::{BackendConfig, ProviderKind};

/// A client request normalized for dispatch. Produced once by the ingress
/// adapter and carried unchanged through fallback attempts; the per-backend
/// model override is applied in [`ProviderAdapter::prepare_body`].
#[derive(Debug, Clone)]
pub struct StandardizedRequest {
    /// Client-visible model name (the routing key).
    pub model: String,

    /// Whether the client asked for a streamed response.
    pub stream: bool,

    /// Headers as received from the client.
    pub original_headers: HeaderMap,

    /// Parsed request body.
    pub original_body: serde_json::Value,
}

/// Abstraction over upstream provider families.
///
/// Object-safe; the registry hands out `Arc<dyn ProviderAdapter>`.
pub trait ProviderAdapter: Send + Sync {
    /// Which provider family this adapter speaks.
    fn kind(&self) -> ProviderKind;

    /// Structural validation of the parsed body beyond what `parse` needs.
    fn validate(&self, body: &serde_json::Value) -> Result<()>;

    /// Turn raw ingress bytes into a [`StandardizedRequest`].
    ///
    /// `path_model` is the model id from the URL path (Bedrock ingress);
    /// `force_stream` is set by stream-specific ingress routes.
    fn parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        path_model: Option<&str>,
        force_stream: bool,
    ) -> Result<StandardizedRequest>;

    /// Upstream URL for this backend and request.
    fn target_url(&self, backend: &BackendConfig, request: &StandardizedRequest) -> Result<String>;

    /// Upstream body bytes, with the per-backend model override applied.
    fn prepare_body(&self, request: &StandardizedRequest, backend: &BackendConfig)
        -> Result<Vec<u8>>;

    /// Upstream headers. Built fresh — client auth and content-length never
    /// leak through — with backend credentials injected.
    fn prepare_headers(
        &self,
        backend: &BackendConfig,
        stream: bool,
        url: &str,
        incoming: &HeaderMap,
        body: &[u8],
    ) -> Result<HeaderMap>;

    /// Binary event-stream framing (Bedrock) vs text SSE.
    fn uses_binary_stream(&self) -> bool;

    /// Per-chunk transformation hook. Identity by default.
    fn process_chunk(&self, chunk: Chunk) -> Chunk {
        chunk
    }

    /// Non-streaming response body hook. Identity by default.
    fn process_body(&self, body: bytes::Bytes) -> bytes::Bytes {
        body
    }

    /// Select which upstream response headers reach the client.
    /// Default: just `Content-Type`.
    fn process_headers(&self, upstream: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = upstream.get(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, content_type.clone());
        }
        headers
    }
}

/// Maps provider discriminators to adapter implementations.
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Registry with the built-in adapters.
    pub fn standard() -> Self {
        let mut adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(ProviderKind::OpenAi, Arc::new(OpenAiAdapter::new()));
        adapters.insert(ProviderKind::Bedrock, Arc::new(BedrockAdapter::new()));
        Self { adapters }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
