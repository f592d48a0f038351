//! Adapter for the AWS Bedrock runtime.
//!
//! Endpoint: `https://bedrock-runtime.{region}.amazonaws.com/model/{model}/`
//! `invoke` or `invoke-with-response-stream`. Requests are signed with SigV4
//! (service `bedrock`); streaming responses use the binary
//! `application/vnd.amazon.eventstream` framing and are forwarded verbatim.

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use http::HeaderMap;
use serde_json::Value;

use super::{ProviderAdapter, StandardizedRequest};
use crate::error::{ProxyError, Result};
use crate::types::{BackendConfig, ProviderKind};

/// Injected into request bodies that do not set their own.
const DEFAULT_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone, Copy, Default)]
pub struct BedrockAdapter;

impl BedrockAdapter {
    pub fn new() -> Self {
        Self
    }

    fn credentials(backend: &BackendConfig) -> Result<(&str, &str, &str)> {
        let region = backend.region.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!("backend '{}' has no region", backend.id))
        })?;
        let access_key = backend.access_key_id.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!("backend '{}' has no access_key_id", backend.id))
        })?;
        let secret_key = backend.secret_access_key.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!(
                "backend '{}' has no secret_access_key",
                backend.id
            ))
        })?;
        Ok((region, access_key, secret_key))
    }
}

/// The model id goes in the URL path; colons in Bedrock ids (version
/// suffixes like `:0`) must be percent-encoded for a canonical SigV4 path.
fn encode_model_id(model: &str) -> String {
    model.replace(':', "%3A")
}

fn host_from_url(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ProxyError::Internal(format!("unexpected upstream url '{url}'")))?;
    Ok(rest.split('/').next().unwrap_or(rest).to_string())
}

impl ProviderAdapter for BedrockAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    fn validate(&self, body: &Value) -> Result<()> {
        if body.is_object() {
            Ok(())
        } else {
            Err(ProxyError::InvalidRequest("body must be a JSON object".into()))
        }
    }

    fn parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        path_model: Option<&str>,
        force_stream: bool,
    ) -> Result<StandardizedRequest> {
        let model = path_model
            .filter(|m| !m.is_empty())
            .ok_or(ProxyError::ModelRequired)?
            .to_string();
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| ProxyError::InvalidRequest(format!("body is not valid JSON: {e}")))?;
        Ok(StandardizedRequest {
            model,
            // Bedrock signals streaming through the endpoint, not the body.
            stream: force_stream,
            original_headers: headers.clone(),
            original_body: body,
        })
    }

    fn target_url(&self, backend: &BackendConfig, request: &StandardizedRequest) -> Result<String> {
        let region = backend.region.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfig(format!("backend '{}' has no region", backend.id))
        })?;
        let model = backend.model.as_deref().unwrap_or(&request.model);
        let endpoint = if request.stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        Ok(format!(
            "https://bedrock-runtime.{region}.amazonaws.com/model/{}/{endpoint}",
            encode_model_id(model)
        ))
    }

    fn prepare_body(
        &self,
        request: &StandardizedRequest,
        _backend: &BackendConfig,
    ) -> Result<Vec<u8>> {
        let mut body = request.original_body.clone();
        if let Some(object) = body.as_object_mut() {
            object
                .entry("anthropic_version")
                .or_insert_with(|| Value::String(DEFAULT_ANTHROPIC_VERSION.into()));
        }
        serde_json::to_vec(&body).map_err(|e| ProxyError::Internal(e.to_string()))
    }

    fn prepare_headers(
        &self,
        backend: &BackendConfig,
        stream: bool,
        url: &str,
        _incoming: &HeaderMap,
        body: &[u8],
    ) -> Result<HeaderMap> {
        let (region, access_key, secret_key) = Self::credentials(backend)?;

        let accept = if stream {
            "application/vnd.amazon.eventstream"
        } else {
            "application/json"
        };
        let unsigned: Vec<(String, String)> = vec![
            ("host".into(), host_from_url(url)?),
            ("content-type".into(), "application/json".into()),
            ("accept".into(), accept.into()),
        ];

        let identity = Credentials::new(access_key, secret_key, None, None, "backend").into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name("bedrock")
            .time(std::time::SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| ProxyError::Internal(format!("sigv4 params: {e}")))?
            .into();
        let signable = SignableRequest::new(
            "POST",
            url,
            unsigned.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| ProxyError::Internal(format!("sigv4 canonical request: {e}")))?;
        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| ProxyError::Internal(format!("sigv4 signing: {e}")))?
            .into_parts();

        let mut request = http::Request::builder().method("POST").uri(url);
        for (name, value) in &unsigned {
            request = request.header(name.as_str(), value.as_str());
        }
        let mut request = request
            .body(())
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        instructions.apply_to_request_http1x(&mut request);
        Ok(request.headers().clone())
    }

    fn uses_binary_stream(&self) -> bool {
        true
    }
}
