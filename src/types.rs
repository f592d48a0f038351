//! Configuration data model: providers, backends, models, API keys.
//!
//! These are the documents the Config Store serves. A [`ModelConfig`] groups
//! an ordered list of [`BackendConfig`]s under one client-visible model name
//! and picks a selection [`Strategy`]; an [`ApiKeyConfig`] gates which models
//! a client key may call.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Upstream provider family a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/v1/chat/completions` with text SSE streaming.
    OpenAi,
    /// AWS Bedrock runtime with SigV4 auth and binary event streams.
    Bedrock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Bedrock => write!(f, "bedrock"),
        }
    }
}

/// One configured upstream endpoint + credentials behind a model.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable identifier, unique within the owning model.
    pub id: String,

    /// Provider family. Must match the owning model's provider.
    pub provider: ProviderKind,

    /// Base URL for OpenAI-style backends (e.g. `https://api.openai.com`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// API key for OpenAI-style backends, sent as `Authorization: Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// AWS region for Bedrock backends (e.g. `us-east-1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// AWS access key id for Bedrock backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    /// AWS secret access key for Bedrock backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,

    /// Relative selection weight. Zero removes the backend from selection
    /// without disabling explicitly targeted requests.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Disabled backends are skipped by selection and fallback.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upstream model name override applied before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Deadline for the first streamed byte, in milliseconds. Unset or 0
    /// disables the deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_ttft_timeout_ms: Option<u64>,

    /// Deadline for the full non-streaming body, in milliseconds. Unset or 0
    /// disables the deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_streaming_ttft_timeout_ms: Option<u64>,

    /// Cap on in-flight requests across all proxy instances. Unset or 0
    /// means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,

    /// When set, built upstream requests are handed to the request recorder.
    #[serde(default)]
    pub record_requests: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_deref().map(redact),
            )
            .field("weight", &self.weight)
            .field("enabled", &self.enabled)
            .field("model", &self.model)
            .field("streaming_ttft_timeout_ms", &self.streaming_ttft_timeout_ms)
            .field(
                "non_streaming_ttft_timeout_ms",
                &self.non_streaming_ttft_timeout_ms,
            )
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("record_requests", &self.record_requests)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    if secret.len() > 6 {
        format!("{}***", &secret[..6])
    } else {
        "***".to_string()
    }
}

impl BackendConfig {
    /// Enabled and carrying a positive weight.
    pub fn is_selectable(&self) -> bool {
        self.enabled && self.weight > 0
    }

    /// Effective concurrency cap; `None` means unlimited.
    pub fn concurrency_cap(&self) -> Option<u32> {
        match self.max_concurrent_requests {
            Some(0) | None => None,
            cap => cap,
        }
    }

    /// TTFT deadline for the given mode; `None` means no deadline.
    pub fn ttft_deadline(&self, stream: bool) -> Option<Duration> {
        let ms = if stream {
            self.streaming_ttft_timeout_ms
        } else {
            self.non_streaming_ttft_timeout_ms
        };
        match ms {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Backend selection strategy for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Random draw proportional to configured weights.
    Weighted,
    /// Lowest recent average time-to-first-token wins. Requires metrics.
    LowestTtft,
    /// Weighted draw penalized by recent error rate, with circuit breaking.
    /// Requires metrics.
    MinErrorRate,
}

impl Strategy {
    /// Strategies that consult the metrics sink during selection.
    pub fn requires_metrics(&self) -> bool {
        matches!(self, Strategy::LowestTtft | Strategy::MinErrorRate)
    }
}

/// Tuning knobs for [`Strategy::MinErrorRate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinErrorRateOptions {
    /// Metrics window consulted, in milliseconds. Default: 15 minutes.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Minimum samples before a backend's error rate is trusted.
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,

    /// Error rate at or above which a backend is circuit-broken.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: f64,

    /// Added to the error rate before dividing, so a clean backend does not
    /// get infinite weight.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_min_requests() -> u64 {
    20
}

fn default_circuit_breaker_threshold() -> f64 {
    0.9
}

fn default_epsilon() -> f64 {
    0.001
}

impl Default for MinErrorRateOptions {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            min_requests: default_min_requests(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            epsilon: default_epsilon(),
        }
    }
}

/// Client-visible model: a named group of backends plus selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique model name clients request.
    pub model: String,

    /// Provider family shared by every backend in the group.
    pub provider: ProviderKind,

    /// Ordered backend list. Order is the deterministic iteration order for
    /// weighted ties and circular fallback.
    pub backends: Vec<BackendConfig>,

    /// Selection strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    /// Options for [`Strategy::MinErrorRate`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_error_rate_options: Option<MinErrorRateOptions>,

    /// Pin sessions (`X-Session-ID`) to the backend that served them.
    #[serde(default)]
    pub enable_affinity: bool,
}

fn default_strategy() -> Strategy {
    Strategy::Weighted
}

impl ModelConfig {
    /// Structural validation: provider agreement and backend id uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(ProxyError::InvalidConfig("model name is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.provider != self.provider {
                return Err(ProxyError::InvalidConfig(format!(
                    "backend '{}' provider '{}' does not match model provider '{}'",
                    backend.id, backend.provider, self.provider
                )));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ProxyError::InvalidConfig(format!(
                    "duplicate backend id '{}' in model '{}'",
                    backend.id, self.model
                )));
            }
        }
        Ok(())
    }

    /// Backends with `enabled = true`, in config order.
    pub fn enabled_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }

    /// Backends with `enabled = true` and `weight > 0`, in config order.
    pub fn selectable_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.is_selectable()).collect()
    }

    /// Look up one backend by id.
    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Effective min-error-rate options (configured or defaults).
    pub fn min_error_rate_options(&self) -> MinErrorRateOptions {
        self.min_error_rate_options.unwrap_or_default()
    }
}

/// A client API key and the models it may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The bearer token value.
    pub key: String,

    /// Human-readable label for logs and admin surfaces.
    #[serde(default)]
    pub name: String,

    /// Models this key may request. `"*"` allows every model.
    #[serde(default)]
    pub allowed_models: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ApiKeyConfig {
    /// Whether this key may call the named model.
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models
            .iter()
            .any(|m| m == "*" || m == model)
    }
}

/// Milliseconds since the Unix epoch. The stores and metrics all share this
/// representation.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
