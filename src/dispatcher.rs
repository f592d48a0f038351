//! The dispatch pipeline: authorize, select, admit, forward, stream, fall
//! back.
//!
//! One dispatch walks a deterministic candidate list: the selected backend
//! first, then the remaining enabled backends in circular order starting
//! just past it (so instances that picked the same initial backend do not
//! herd onto the same secondary). Each admitted attempt releases its
//! concurrency slot and writes exactly one metric, on every path — success,
//! upstream failure, TTFT expiry, mid-stream error, or client disconnect.
//! Fallback stops the moment a byte reaches the client.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::active::{ActiveRequestStore, MemoryActiveRequestStore};
use crate::affinity::{AffinityMap, AffinityStore, MemoryAffinityStore};
use crate::balancer::LoadBalancer;
use crate::config_store::ConfigStore;
use crate::error::{ProxyError, Result};
use crate::limiter::{Admission, ConcurrencyLimiter};
use crate::metrics::{MemoryMetricsSink, MetricStatus, MetricsSink, RequestMetric, StreamType};
use crate::provider::{ProviderAdapter, ProviderRegistry, StandardizedRequest};
use crate::recorder::{NoopRequestRecorder, RecordedRequest, RequestRecorder};
use crate::streaming::{Chunk, Utf8ChunkDecoder};
use crate::types::{now_ms, BackendConfig, ModelConfig, ProviderKind};
use crate::upstream::{HttpUpstreamClient, UpstreamClient};

/// Header forcing selection of a specific backend.
pub const BACKEND_ID_HEADER: &str = "x-backend-id";

/// Header carrying the session-affinity key.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// A raw client request as it entered one of the ingress routes.
#[derive(Debug)]
pub struct IngressRequest {
    /// Which ingress dialect the bytes are in.
    pub provider: ProviderKind,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Model id from the URL path (Bedrock ingress).
    pub path_model: Option<String>,
    /// Set by stream-specific ingress routes.
    pub force_stream: bool,
}

/// Client-facing body produced by a successful dispatch.
pub enum OutcomeBody {
    Full(Bytes),
    Stream(futures::stream::BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for OutcomeBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            OutcomeBody::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// A successful dispatch: status and filtered headers from the upstream,
/// plus the (possibly still streaming) body.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: OutcomeBody,
}

/// Everything a dispatch needs, composed once at startup.
pub struct Dispatcher {
    config: Arc<ConfigStore>,
    balancer: LoadBalancer,
    limiter: Arc<ConcurrencyLimiter>,
    metrics: Arc<dyn MetricsSink>,
    affinity: Arc<AffinityMap>,
    providers: ProviderRegistry,
    upstream: Arc<dyn UpstreamClient>,
    recorder: Arc<dyn RequestRecorder>,
    instance_id: String,
}

/// Builder for [`Dispatcher`]. Every dependency defaults to its in-memory
/// implementation, so tests swap in only what they observe.
pub struct DispatcherBuilder {
    config: Arc<ConfigStore>,
    upstream: Option<Arc<dyn UpstreamClient>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    active_requests: Option<Arc<dyn ActiveRequestStore>>,
    affinity_store: Option<Arc<dyn AffinityStore>>,
    recorder: Option<Arc<dyn RequestRecorder>>,
    instance_id: Option<String>,
}

impl DispatcherBuilder {
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn active_requests(mut self, store: Arc<dyn ActiveRequestStore>) -> Self {
        self.active_requests = Some(store);
        self
    }

    pub fn affinity_store(mut self, store: Arc<dyn AffinityStore>) -> Self {
        self.affinity_store = Some(store);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn RequestRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn build(self) -> Dispatcher {
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MemoryMetricsSink::new()));
        let active_requests = self
            .active_requests
            .unwrap_or_else(|| Arc::new(MemoryActiveRequestStore::new()));
        let affinity_store = self
            .affinity_store
            .unwrap_or_else(|| Arc::new(MemoryAffinityStore::new()));
        let affinity = Arc::new(AffinityMap::new(affinity_store));
        Dispatcher {
            balancer: LoadBalancer::new(Arc::clone(&metrics), Arc::clone(&affinity)),
            limiter: Arc::new(ConcurrencyLimiter::new(active_requests, instance_id.clone())),
            config: self.config,
            metrics,
            affinity,
            providers: ProviderRegistry::standard(),
            upstream: self
                .upstream
                .unwrap_or_else(|| Arc::new(HttpUpstreamClient::new())),
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NoopRequestRecorder)),
            instance_id,
        }
    }
}

impl Dispatcher {
    pub fn builder(config: Arc<ConfigStore>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            upstream: None,
            metrics: None,
            active_requests: None,
            affinity_store: None,
            recorder: None,
            instance_id: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn affinity(&self) -> Arc<AffinityMap> {
        Arc::clone(&self.affinity)
    }

    /// Run one client request through the full pipeline.
    pub async fn dispatch(&self, ingress: IngressRequest) -> Result<DispatchOutcome> {
        let ingress_adapter = self.providers.get(ingress.provider).ok_or_else(|| {
            ProxyError::Internal(format!("no adapter for provider '{}'", ingress.provider))
        })?;

        let token = bearer_token(&ingress.headers).ok_or(ProxyError::InvalidApiKey)?;
        let api_key = self
            .config
            .get_api_key(token)
            .await
            .filter(|key| key.enabled)
            .ok_or(ProxyError::InvalidApiKey)?;

        let request = ingress_adapter.parse(
            &ingress.headers,
            &ingress.body,
            ingress.path_model.as_deref(),
            ingress.force_stream,
        )?;
        ingress_adapter.validate(&request.original_body)?;

        if !api_key.allows_model(&request.model) {
            return Err(ProxyError::ModelNotAllowed(request.model));
        }

        let model = self
            .config
            .get_model(&request.model)
            .await
            .ok_or_else(|| ProxyError::ModelNotFound(request.model.clone()))?;

        let explicit = header_str(&ingress.headers, BACKEND_ID_HEADER);
        let session = header_str(&ingress.headers, SESSION_ID_HEADER);

        let initial = self
            .balancer
            .select(&model, explicit, request.stream, session)
            .await?
            .ok_or_else(|| ProxyError::NoBackend(model.model.clone()))?;

        let request_id = Uuid::new_v4().to_string();
        let candidates = fallback_candidates(&model, &initial);
        let egress = self.providers.get(model.provider).ok_or_else(|| {
            ProxyError::Internal(format!("no adapter for provider '{}'", model.provider))
        })?;

        info!(
            model = %model.model,
            backend_id = %initial.id,
            request_id = %request_id,
            stream = request.stream,
            candidates = candidates.len(),
            "dispatching"
        );

        let mut last_error: Option<ProxyError> = None;
        for backend in &candidates {
            match self
                .attempt(&egress, &model, backend, &request, &request_id)
                .await
            {
                Ok(outcome) => {
                    if model.enable_affinity {
                        if let Some(session) = session {
                            self.affinity.record(&model.model, session, &backend.id);
                        }
                    }
                    return Ok(outcome);
                }
                Err(err) if err.allows_fallback() => {
                    warn!(
                        backend_id = %backend.id,
                        request_id = %request_id,
                        code = %err.code(),
                        "attempt failed; falling back"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::NoBackend(model.model.clone())))
    }

    /// One attempt against one backend: admit, build, forward, hand off to
    /// the response pipeline. Every path past admission releases the slot
    /// and writes one metric.
    async fn attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        model: &ModelConfig,
        backend: &BackendConfig,
        request: &StandardizedRequest,
        request_id: &str,
    ) -> Result<DispatchOutcome> {
        if self.limiter.try_acquire(backend, request_id).await == Admission::AtCapacity {
            debug!(backend_id = %backend.id, "backend at capacity");
            return Err(ProxyError::AllBackendsAtCapacity);
        }

        let started = Instant::now();

        let built = adapter.target_url(backend, request).and_then(|url| {
            let body = adapter.prepare_body(request, backend)?;
            let headers = adapter.prepare_headers(
                backend,
                request.stream,
                &url,
                &request.original_headers,
                &body,
            )?;
            Ok((url, body, headers))
        });
        let (url, body, headers) = match built {
            Ok(parts) => parts,
            Err(err) => {
                self.finish_failure(backend, model, request, request_id, started, &err)
                    .await;
                return Err(err);
            }
        };

        if backend.record_requests {
            self.recorder.record(RecordedRequest {
                request_id: request_id.to_string(),
                backend_id: backend.id.clone(),
                model: model.model.clone(),
                url: url.clone(),
                timestamp_ms: now_ms(),
                body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
            });
        }

        let response = match self.upstream.send(&url, headers, body).await {
            Ok(response) => response,
            Err(err) => {
                self.finish_failure(backend, model, request, request_id, started, &err)
                    .await;
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let content_type = response.headers().get(http::header::CONTENT_TYPE).cloned();
            let body = response.bytes().await.unwrap_or_default();
            let err = ProxyError::UpstreamHttp {
                status: status.as_u16(),
                body,
                content_type,
            };
            self.finish_failure(backend, model, request, request_id, started, &err)
                .await;
            return Err(err);
        }

        if request.stream {
            self.stream_pipeline(adapter, model, backend, request, request_id, started, response)
                .await
        } else {
            self.json_pipeline(adapter, model, backend, request, request_id, started, response)
                .await
        }
    }

    /// Non-streaming path: read and parse the full body under the deadline.
    #[allow(clippy::too_many_arguments)]
    async fn json_pipeline(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        model: &ModelConfig,
        backend: &BackendConfig,
        request: &StandardizedRequest,
        request_id: &str,
        started: Instant,
        response: reqwest::Response,
    ) -> Result<DispatchOutcome> {
        let status = response.status();
        let headers = adapter.process_headers(response.headers());

        let read = response.bytes();
        let body = match backend.ttft_deadline(false) {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    let err = ProxyError::TtftTimeout;
                    self.finish_failure(backend, model, request, request_id, started, &err)
                        .await;
                    return Err(err);
                }
                match tokio::time::timeout(remaining, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = ProxyError::TtftTimeout;
                        self.finish_failure(backend, model, request, request_id, started, &err)
                            .await;
                        return Err(err);
                    }
                }
            }
            None => read.await,
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                let err = ProxyError::Network(err.to_string());
                self.finish_failure(backend, model, request, request_id, started, &err)
                    .await;
                return Err(err);
            }
        };

        if let Err(err) = serde_json::from_slice::<serde_json::Value>(&body) {
            let err = ProxyError::Network(format!("upstream returned invalid JSON: {err}"));
            self.finish_failure(backend, model, request, request_id, started, &err)
                .await;
            return Err(err);
        }
        let body = adapter.process_body(body);

        let elapsed = started.elapsed().as_millis() as u64;
        self.metrics.record_request_complete(RequestMetric {
            instance_id: self.instance_id.clone(),
            backend_id: backend.id.clone(),
            timestamp_ms: now_ms(),
            request_id: request_id.to_string(),
            status: MetricStatus::Success,
            duration_ms: elapsed,
            ttft_ms: Some(elapsed),
            stream_type: Some(StreamType::NonStreaming),
            model: Some(model.model.clone()),
            error_type: None,
        });
        self.limiter.release(&backend.id, request_id).await;

        Ok(DispatchOutcome {
            status,
            headers,
            body: OutcomeBody::Full(body),
        })
    }

    /// Streaming path: race the first chunk against the TTFT deadline, then
    /// pump chunks to the client. Past the first byte there is no fallback;
    /// the guard settles release + metric exactly once however the stream
    /// ends.
    #[allow(clippy::too_many_arguments)]
    async fn stream_pipeline(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        model: &ModelConfig,
        backend: &BackendConfig,
        request: &StandardizedRequest,
        request_id: &str,
        started: Instant,
        response: reqwest::Response,
    ) -> Result<DispatchOutcome> {
        let status = response.status();
        let headers = adapter.process_headers(response.headers());
        let mut upstream_stream = response.bytes_stream();

        let first = match backend.ttft_deadline(true) {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    let err = ProxyError::TtftTimeout;
                    self.finish_failure(backend, model, request, request_id, started, &err)
                        .await;
                    return Err(err);
                }
                match tokio::time::timeout(remaining, upstream_stream.next()).await {
                    Ok(first) => first,
                    Err(_) => {
                        // Dropping the reader cancels the in-flight upstream
                        // read.
                        drop(upstream_stream);
                        let err = ProxyError::TtftTimeout;
                        self.finish_failure(backend, model, request, request_id, started, &err)
                            .await;
                        return Err(err);
                    }
                }
            }
            None => upstream_stream.next().await,
        };

        let ttft_ms = started.elapsed().as_millis() as u64;
        let first_bytes = match first {
            None => {
                // Upstream EOF before any bytes: an empty but successful
                // stream.
                self.metrics.record_request_complete(RequestMetric {
                    instance_id: self.instance_id.clone(),
                    backend_id: backend.id.clone(),
                    timestamp_ms: now_ms(),
                    request_id: request_id.to_string(),
                    status: MetricStatus::Success,
                    duration_ms: ttft_ms,
                    ttft_ms: Some(ttft_ms),
                    stream_type: Some(StreamType::Streaming),
                    model: Some(model.model.clone()),
                    error_type: None,
                });
                self.limiter.release(&backend.id, request_id).await;
                return Ok(DispatchOutcome {
                    status,
                    headers,
                    body: OutcomeBody::Stream(Box::pin(futures::stream::empty())),
                });
            }
            Some(Err(err)) => {
                let err = ProxyError::Network(err.to_string());
                self.finish_failure(backend, model, request, request_id, started, &err)
                    .await;
                return Err(err);
            }
            Some(Ok(bytes)) => bytes,
        };

        let mut guard = StreamGuard {
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
            instance_id: self.instance_id.clone(),
            backend_id: backend.id.clone(),
            request_id: request_id.to_string(),
            model: model.model.clone(),
            ttft_ms,
            started,
            done: false,
        };
        let adapter = Arc::clone(adapter);
        let binary = adapter.uses_binary_stream();

        let stream: futures::stream::BoxStream<'static, Result<Bytes>> =
            Box::pin(async_stream::stream! {
                let mut decoder = Utf8ChunkDecoder::new();

                let first = frame_chunk(&adapter, binary, &mut decoder, first_bytes);
                if !first.is_empty() {
                    yield Ok(first.into_bytes());
                }

                while let Some(next) = upstream_stream.next().await {
                    match next {
                        Ok(bytes) => {
                            let chunk = frame_chunk(&adapter, binary, &mut decoder, bytes);
                            if !chunk.is_empty() {
                                yield Ok(chunk.into_bytes());
                            }
                        }
                        Err(err) => {
                            guard.finish_interrupted();
                            yield Err(ProxyError::StreamInterrupted(err.to_string()));
                            return;
                        }
                    }
                }

                if !binary {
                    let tail = decoder.flush();
                    if !tail.is_empty() {
                        let chunk = adapter.process_chunk(Chunk::Text(tail));
                        if !chunk.is_empty() {
                            yield Ok(chunk.into_bytes());
                        }
                    }
                }
                guard.finish_success();
            });

        Ok(DispatchOutcome {
            status,
            headers,
            body: OutcomeBody::Stream(stream),
        })
    }

    /// Failure bookkeeping for an admitted attempt: one metric, one release.
    async fn finish_failure(
        &self,
        backend: &BackendConfig,
        model: &ModelConfig,
        request: &StandardizedRequest,
        request_id: &str,
        started: Instant,
        err: &ProxyError,
    ) {
        self.metrics.record_request_complete(RequestMetric {
            instance_id: self.instance_id.clone(),
            backend_id: backend.id.clone(),
            timestamp_ms: now_ms(),
            request_id: request_id.to_string(),
            status: MetricStatus::Failure,
            duration_ms: started.elapsed().as_millis() as u64,
            ttft_ms: None,
            stream_type: Some(if request.stream {
                StreamType::Streaming
            } else {
                StreamType::NonStreaming
            }),
            model: Some(model.model.clone()),
            error_type: Some(err.code()),
        });
        self.limiter.release(&backend.id, request_id).await;
    }
}

/// Candidate order for one dispatch: the initial pick, then the enabled
/// list rotated to start just past it.
fn fallback_candidates(model: &ModelConfig, initial: &BackendConfig) -> Vec<BackendConfig> {
    let enabled: Vec<&BackendConfig> = model.enabled_backends();
    let mut candidates = vec![initial.clone()];
    match enabled.iter().position(|b| b.id == initial.id) {
        Some(position) => {
            for offset in 1..enabled.len() {
                candidates.push(enabled[(position + offset) % enabled.len()].clone());
            }
        }
        None => {
            candidates.extend(enabled.into_iter().filter(|b| b.id != initial.id).cloned());
        }
    }
    candidates
}

fn frame_chunk(
    adapter: &Arc<dyn ProviderAdapter>,
    binary: bool,
    decoder: &mut Utf8ChunkDecoder,
    bytes: Bytes,
) -> Chunk {
    if binary {
        adapter.process_chunk(Chunk::Binary(bytes))
    } else {
        adapter.process_chunk(Chunk::Text(decoder.decode(&bytes)))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Settles the streaming attempt exactly once: on clean EOF, mid-stream
/// error, or drop (client disconnect). Release is async, so drop paths hand
/// it to the runtime.
struct StreamGuard {
    limiter: Arc<ConcurrencyLimiter>,
    metrics: Arc<dyn MetricsSink>,
    instance_id: String,
    backend_id: String,
    request_id: String,
    model: String,
    ttft_ms: u64,
    started: Instant,
    done: bool,
}

impl StreamGuard {
    fn finish_success(&mut self) {
        self.finish(MetricStatus::Success, None);
    }

    fn finish_interrupted(&mut self) {
        self.finish(MetricStatus::Failure, Some("stream_interrupted"));
    }

    fn finish(&mut self, status: MetricStatus, error_type: Option<&str>) {
        if self.done {
            return;
        }
        self.done = true;
        self.metrics.record_request_complete(RequestMetric {
            instance_id: self.instance_id.clone(),
            backend_id: self.backend_id.clone(),
            timestamp_ms: now_ms(),
            request_id: self.request_id.clone(),
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            ttft_ms: Some(self.ttft_ms),
            stream_type: Some(StreamType::Streaming),
            model: Some(self.model.clone()),
            error_type: error_type.map(str::to_string),
        });
        let limiter = Arc::clone(&self.limiter);
        let backend_id = self.backend_id.clone();
        let request_id = self.request_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                limiter.release(&backend_id, &request_id).await;
            });
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.finish_interrupted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::ActiveRequest;
    use crate::config_store::MemoryConfigStore;
    use crate::metrics::MemoryMetricsSink;
    use crate::recorder::MemoryRequestRecorder;
    use crate::types::test_support::{api_key, backend, model};
    use crate::upstream::{MockReply, MockUpstream, StreamEvent};
    use serde_json::json;
    use std::time::Duration;

    fn openai_body(model: &str, stream: bool) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
                "model": model,
                "messages": [{"role": "user", "content": "hi"}],
                "stream": stream,
            }))
            .unwrap(),
        )
    }

    fn ingress(model: &str, stream: bool, extra: &[(&str, &str)]) -> IngressRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer sk-client".parse().unwrap());
        for (name, value) in extra {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        IngressRequest {
            provider: ProviderKind::OpenAi,
            headers,
            body: openai_body(model, stream),
            path_model: None,
            force_stream: false,
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        upstream: Arc<MockUpstream>,
        metrics: Arc<MemoryMetricsSink>,
        active: Arc<MemoryActiveRequestStore>,
        affinity_store: Arc<MemoryAffinityStore>,
        recorder: Arc<MemoryRequestRecorder>,
    }

    async fn harness(models: Vec<ModelConfig>, upstream: MockUpstream) -> Harness {
        let config = Arc::new(
            ConfigStore::load(Arc::new(MemoryConfigStore::seeded(
                models,
                vec![api_key("sk-client")],
            )))
            .await
            .unwrap(),
        );
        let upstream = Arc::new(upstream);
        let metrics = Arc::new(MemoryMetricsSink::new());
        let active = Arc::new(MemoryActiveRequestStore::new());
        let affinity_store = Arc::new(MemoryAffinityStore::new());
        let recorder = Arc::new(MemoryRequestRecorder::new());
        let dispatcher = Dispatcher::builder(config)
            .upstream(upstream.clone())
            .metrics(metrics.clone())
            .active_requests(active.clone())
            .affinity_store(affinity_store.clone())
            .recorder(recorder.clone())
            .instance_id("inst-test")
            .build();
        Harness {
            dispatcher,
            upstream,
            metrics,
            active,
            affinity_store,
            recorder,
        }
    }

    async fn collect_stream(body: OutcomeBody) -> Vec<Result<Bytes>> {
        match body {
            OutcomeBody::Stream(stream) => stream.collect().await,
            OutcomeBody::Full(_) => panic!("expected a streaming body"),
        }
    }

    fn full_body(body: OutcomeBody) -> Bytes {
        match body {
            OutcomeBody::Full(bytes) => bytes,
            OutcomeBody::Stream(_) => panic!("expected a full body"),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_for_release(active: &MemoryActiveRequestStore, backend_id: &str) {
        for _ in 0..200 {
            if active.get_count(backend_id).await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("admission on '{backend_id}' was never released");
    }

    // Scenario S3: first backend 500s, second succeeds; client sees the
    // second body, both admissions released, one metric each.
    #[tokio::test]
    async fn test_fallback_on_upstream_500() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a"), backend("b"), backend("c")])],
            MockUpstream::new()
                .on("a.test", MockReply::status(500, r#"{"error":"boom"}"#))
                .on("b.test", MockReply::ok_json(r#"{"ok":true}"#)),
        )
        .await;

        // Pin the initial pick to "a" so the rotation is deterministic.
        let outcome = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(full_body(outcome.body), Bytes::from_static(br#"{"ok":true}"#));

        assert_eq!(h.upstream.calls_matching("a.test"), 1);
        assert_eq!(h.upstream.calls_matching("b.test"), 1);
        assert_eq!(h.upstream.calls_matching("c.test"), 0);

        let a_points = h.metrics.points_for_backend("a");
        assert_eq!(a_points.len(), 1);
        assert_eq!(a_points[0].status, MetricStatus::Failure);
        assert_eq!(a_points[0].error_type.as_deref(), Some("http_500"));
        let b_points = h.metrics.points_for_backend("b");
        assert_eq!(b_points.len(), 1);
        assert_eq!(b_points[0].status, MetricStatus::Success);

        assert_eq!(h.active.get_count("a").await.unwrap(), 0);
        assert_eq!(h.active.get_count("b").await.unwrap(), 0);
    }

    // Fallback rotation starts just past the initial pick and wraps.
    #[tokio::test]
    async fn test_circular_fallback_order() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a"), backend("b"), backend("c")])],
            MockUpstream::new().otherwise(MockReply::NetworkError("refused".into())),
        )
        .await;

        let err = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Network(_)));

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("b.test"));
        assert!(calls[1].contains("c.test"));
        assert!(calls[2].contains("a.test"));
    }

    // Property 4: every candidate tried at most once.
    #[tokio::test]
    async fn test_fallback_terminates_without_repeats() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a"), backend("b")])],
            MockUpstream::new().otherwise(MockReply::NetworkError("refused".into())),
        )
        .await;
        let err = h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        assert!(matches!(err, ProxyError::Network(_)));
        assert_eq!(h.upstream.calls().len(), 2);
        assert_eq!(h.upstream.calls_matching("a.test"), 1);
        assert_eq!(h.upstream.calls_matching("b.test"), 1);
    }

    // Scenario S2: explicit override to a disabled backend fails without
    // touching admission or the network.
    #[tokio::test]
    async fn test_explicit_override_to_disabled_backend() {
        let mut b1 = backend("b1");
        b1.enabled = false;
        let h = harness(
            vec![model("gpt-4", vec![b1])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;

        let err = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "b1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendDisabled(id) if id == "b1"));
        assert!(h.upstream.calls().is_empty());
        assert_eq!(h.active.get_count("b1").await.unwrap(), 0);
    }

    // Property 6: an explicit override only ever reaches that backend.
    #[tokio::test]
    async fn test_explicit_override_unknown_backend() {
        let h = harness(
            vec![model("gpt-4", vec![backend("b1")])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;
        let err = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "ghost")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendNotFound(id) if id == "ghost"));
        assert!(h.upstream.calls().is_empty());
    }

    // Scenario S4: TTFT timeout on the first backend's stream, fallback
    // delivers the second backend's stream.
    #[tokio::test]
    async fn test_streaming_ttft_timeout_falls_back() {
        let mut a = backend("a");
        a.streaming_ttft_timeout_ms = Some(100);
        let b = backend("b");
        let h = harness(
            vec![model("gpt-4", vec![a, b])],
            MockUpstream::new()
                .on(
                    "a.test",
                    MockReply::Stream {
                        status: 200,
                        events: vec![
                            StreamEvent::Delay(Duration::from_millis(400)),
                            StreamEvent::Chunk(Bytes::from_static(b"late")),
                        ],
                    },
                )
                .on("b.test", MockReply::stream(&["data: {\"ok\":1}\n\n"])),
        )
        .await;

        let outcome = h
            .dispatcher
            .dispatch(ingress("gpt-4", true, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        let chunks = collect_stream(outcome.body).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap(),
            &Bytes::from_static(b"data: {\"ok\":1}\n\n")
        );

        let a_points = h.metrics.points_for_backend("a");
        assert_eq!(a_points.len(), 1);
        assert_eq!(a_points[0].error_type.as_deref(), Some("ttft_timeout"));
        wait_for_release(&h.active, "a").await;
        wait_for_release(&h.active, "b").await;
        let b_points = h.metrics.points_for_backend("b");
        assert_eq!(b_points.len(), 1);
        assert_eq!(b_points[0].status, MetricStatus::Success);
        assert!(b_points[0].ttft_ms.is_some());
    }

    // Non-streaming TTFT deadline covers the full body read.
    #[tokio::test]
    async fn test_non_streaming_ttft_timeout_falls_back() {
        let mut a = backend("a");
        a.non_streaming_ttft_timeout_ms = Some(100);
        let h = harness(
            vec![model("gpt-4", vec![a, backend("b")])],
            MockUpstream::new()
                .on(
                    "a.test",
                    MockReply::Stream {
                        status: 200,
                        events: vec![
                            StreamEvent::Delay(Duration::from_millis(400)),
                            StreamEvent::Chunk(Bytes::from_static(b"{}")),
                        ],
                    },
                )
                .on("b.test", MockReply::ok_json(r#"{"ok":true}"#)),
        )
        .await;

        let outcome = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        assert_eq!(full_body(outcome.body), Bytes::from_static(br#"{"ok":true}"#));
        let a_points = h.metrics.points_for_backend("a");
        assert_eq!(a_points[0].error_type.as_deref(), Some("ttft_timeout"));
    }

    // Scenario S5: every candidate at its cap yields 429.
    #[tokio::test]
    async fn test_all_backends_at_capacity() {
        let mut a = backend("a");
        a.max_concurrent_requests = Some(1);
        let mut b = backend("b");
        b.max_concurrent_requests = Some(1);
        let h = harness(
            vec![model("gpt-4", vec![a, b])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;

        // Both backends already hold one in-flight request.
        h.active
            .record_start("a", &ActiveRequest::new("other-1", "inst-other"))
            .await
            .unwrap();
        h.active
            .record_start("b", &ActiveRequest::new("other-2", "inst-other"))
            .await
            .unwrap();

        let err = h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        assert!(matches!(err, ProxyError::AllBackendsAtCapacity));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(h.upstream.calls().is_empty());
        // The pre-existing records are untouched.
        assert_eq!(h.active.get_count("a").await.unwrap(), 1);
        assert_eq!(h.active.get_count("b").await.unwrap(), 1);
    }

    // A capped backend falls back to an uncapped one.
    #[tokio::test]
    async fn test_capacity_denial_falls_back() {
        let mut a = backend("a");
        a.max_concurrent_requests = Some(1);
        let h = harness(
            vec![model("gpt-4", vec![a, backend("b")])],
            MockUpstream::new().on("b.test", MockReply::ok_json(r#"{"ok":true}"#)),
        )
        .await;
        h.active
            .record_start("a", &ActiveRequest::new("other", "inst-other"))
            .await
            .unwrap();

        let outcome = h
            .dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(h.upstream.calls_matching("a.test"), 0);
        assert_eq!(h.upstream.calls_matching("b.test"), 1);
    }

    // Scenarios S6/S7: affinity stickiness and invalidation.
    #[tokio::test]
    async fn test_session_affinity_sticks_and_invalidates() {
        let mut m = model("gpt-4", vec![backend("b1"), backend("b2")]);
        m.enable_affinity = true;
        let config = Arc::new(
            ConfigStore::load(Arc::new(MemoryConfigStore::seeded(
                vec![m.clone()],
                vec![api_key("sk-client")],
            )))
            .await
            .unwrap(),
        );
        let upstream = Arc::new(MockUpstream::new().otherwise(MockReply::ok_json("{}")));
        let affinity_store = Arc::new(MemoryAffinityStore::new());
        let dispatcher = Dispatcher::builder(config.clone())
            .upstream(upstream.clone())
            .affinity_store(affinity_store.clone())
            .instance_id("inst-test")
            .build();

        // First request pins the session to b2 (explicitly targeted).
        dispatcher
            .dispatch(ingress(
                "gpt-4",
                false,
                &[(BACKEND_ID_HEADER, "b2"), (SESSION_ID_HEADER, "s1")],
            ))
            .await
            .unwrap();
        let mut pinned = false;
        for _ in 0..200 {
            if affinity_store.get("gpt-4", "s1").await.unwrap().is_some() {
                pinned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(pinned, "affinity upsert never landed");

        // Subsequent requests follow the pin regardless of weights.
        for _ in 0..5 {
            dispatcher
                .dispatch(ingress("gpt-4", false, &[(SESSION_ID_HEADER, "s1")]))
                .await
                .unwrap();
        }
        assert_eq!(upstream.calls_matching("b2.test"), 6);
        assert_eq!(upstream.calls_matching("b1.test"), 0);

        // Disable b2: the next request must re-route and purge the mapping.
        let mut updated = m.clone();
        updated.backends[1].enabled = false;
        config.upsert_model(updated).await.unwrap();

        dispatcher
            .dispatch(ingress("gpt-4", false, &[(SESSION_ID_HEADER, "s1")]))
            .await
            .unwrap();
        assert_eq!(upstream.calls_matching("b1.test"), 1);
        assert_eq!(upstream.calls_matching("b2.test"), 6);
        // The stale pin is gone; the session may already be re-pinned to the
        // backend that actually served it, but never to b2.
        if let Some(mapping) = affinity_store.get("gpt-4", "s1").await.unwrap() {
            assert_eq!(mapping.backend_id, "b1");
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_rejected() {
        let h = harness(
            vec![model("gpt-4", vec![backend("b1")])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;
        let mut request = ingress("gpt-4", false, &[]);
        request.headers.remove(AUTHORIZATION);
        let err = h.dispatcher.dispatch(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidApiKey));
        assert!(h.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_not_allowed_for_key() {
        let config = Arc::new(
            ConfigStore::load(Arc::new(MemoryConfigStore::seeded(
                vec![model("gpt-4", vec![backend("b1")])],
                vec![crate::types::ApiKeyConfig {
                    key: "sk-client".into(),
                    name: "narrow".into(),
                    allowed_models: vec!["other-model".into()],
                    enabled: true,
                }],
            )))
            .await
            .unwrap(),
        );
        let dispatcher = Dispatcher::builder(config)
            .upstream(Arc::new(MockUpstream::new()))
            .build();
        let err = dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        assert!(matches!(err, ProxyError::ModelNotAllowed(m) if m == "gpt-4"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_503() {
        let h = harness(vec![], MockUpstream::new()).await;
        let err = h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        assert!(matches!(err, ProxyError::ModelNotFound(_)));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_no_selectable_backend_is_503() {
        let mut b1 = backend("b1");
        b1.weight = 0;
        let h = harness(
            vec![model("gpt-4", vec![b1])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;
        let err = h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoBackend(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_no_fallback() {
        let h = harness(
            vec![model("gpt-4", vec![backend("b1")])],
            MockUpstream::new().otherwise(MockReply::ok_json("{}")),
        )
        .await;
        let mut request = ingress("gpt-4", false, &[]);
        request.body = Bytes::from_static(b"{not json");
        let err = h.dispatcher.dispatch(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert!(h.upstream.calls().is_empty());
    }

    // Mid-stream upstream failure: bytes already delivered, so no fallback;
    // the metric says stream_interrupted and the slot is released.
    #[tokio::test]
    async fn test_stream_interrupted_mid_flight() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a"), backend("b")])],
            MockUpstream::new().on(
                "a.test",
                MockReply::Stream {
                    status: 200,
                    events: vec![
                        StreamEvent::Chunk(Bytes::from_static(b"data: {\"x\":1}\n\n")),
                        StreamEvent::Error("connection reset".into()),
                    ],
                },
            ),
        )
        .await;

        let outcome = h
            .dispatcher
            .dispatch(ingress("gpt-4", true, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        let chunks = collect_stream(outcome.body).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(
            chunks[1].as_ref().unwrap_err(),
            ProxyError::StreamInterrupted(_)
        ));

        // No fallback to "b" after first byte.
        assert_eq!(h.upstream.calls_matching("b.test"), 0);
        let points = h.metrics.points_for_backend("a");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].error_type.as_deref(), Some("stream_interrupted"));
        wait_for_release(&h.active, "a").await;
    }

    // Property 1 under client disconnect: dropping the body stream settles
    // the attempt as interrupted and releases the slot.
    #[tokio::test]
    async fn test_client_disconnect_releases_admission() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a")])],
            MockUpstream::new().on(
                "a.test",
                MockReply::Stream {
                    status: 200,
                    events: vec![
                        StreamEvent::Chunk(Bytes::from_static(b"data: 1\n\n")),
                        StreamEvent::Delay(Duration::from_secs(30)),
                        StreamEvent::Chunk(Bytes::from_static(b"data: 2\n\n")),
                    ],
                },
            ),
        )
        .await;

        let outcome = h.dispatcher.dispatch(ingress("gpt-4", true, &[])).await.unwrap();
        let mut stream = match outcome.body {
            OutcomeBody::Stream(stream) => stream,
            OutcomeBody::Full(_) => panic!("expected stream"),
        };
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream); // client goes away

        wait_for_release(&h.active, "a").await;
        wait_until(|| {
            h.metrics
                .points_for_backend("a")
                .iter()
                .any(|p| p.error_type.as_deref() == Some("stream_interrupted"))
        })
        .await;
    }

    // Upstream EOF before any bytes is an empty, successful stream.
    #[tokio::test]
    async fn test_empty_stream_is_success() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a")])],
            MockUpstream::new().on(
                "a.test",
                MockReply::Stream {
                    status: 200,
                    events: vec![],
                },
            ),
        )
        .await;
        let outcome = h.dispatcher.dispatch(ingress("gpt-4", true, &[])).await.unwrap();
        let chunks = collect_stream(outcome.body).await;
        assert!(chunks.is_empty());
        let points = h.metrics.points_for_backend("a");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].status, MetricStatus::Success);
        assert_eq!(h.active.get_count("a").await.unwrap(), 0);
    }

    // Streaming success records observed TTFT and releases on EOF.
    #[tokio::test]
    async fn test_streaming_success_metric_and_release() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a")])],
            MockUpstream::new().on(
                "a.test",
                MockReply::stream(&["data: {\"d\":\"x\"}\n\n", "data: [DONE]\n\n"]),
            ),
        )
        .await;
        let outcome = h.dispatcher.dispatch(ingress("gpt-4", true, &[])).await.unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(
            outcome.headers.get("content-type").unwrap(),
            "text/event-stream"
        );
        let chunks = collect_stream(outcome.body).await;
        assert_eq!(chunks.len(), 2);

        wait_for_release(&h.active, "a").await;
        let points = h.metrics.points_for_backend("a");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].status, MetricStatus::Success);
        assert_eq!(points[0].stream_type, Some(StreamType::Streaming));
        assert!(points[0].ttft_ms.is_some());
    }

    // Upstream 4xx/5xx bodies propagate verbatim on the final attempt.
    #[tokio::test]
    async fn test_final_upstream_error_body_propagates() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a")])],
            MockUpstream::new().on("a.test", MockReply::status(429, r#"{"error":"slow down"}"#)),
        )
        .await;
        let err = h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap_err();
        match err {
            ProxyError::UpstreamHttp { status, body, .. } => {
                assert_eq!(status, 429);
                assert_eq!(body, Bytes::from_static(br#"{"error":"slow down"}"#));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorder_receives_built_request() {
        let mut a = backend("a");
        a.record_requests = true;
        a.model = Some("gpt-4-turbo".into());
        let h = harness(
            vec![model("gpt-4", vec![a])],
            MockUpstream::new().on("a.test", MockReply::ok_json("{}")),
        )
        .await;
        h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap();
        let recorded = h.recorder.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].backend_id, "a");
        // The snapshot reflects the body as built: override applied.
        assert_eq!(recorded[0].body["model"], "gpt-4-turbo");
    }

    #[tokio::test]
    async fn test_recorder_not_invoked_when_disabled() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a")])],
            MockUpstream::new().on("a.test", MockReply::ok_json("{}")),
        )
        .await;
        h.dispatcher.dispatch(ingress("gpt-4", false, &[])).await.unwrap();
        assert!(h.recorder.recorded().is_empty());
    }

    // Property 2 for a multi-attempt dispatch: one metric per attempt, all
    // sharing the dispatch's request id.
    #[tokio::test]
    async fn test_one_metric_per_attempt() {
        let h = harness(
            vec![model("gpt-4", vec![backend("a"), backend("b")])],
            MockUpstream::new()
                .on("a.test", MockReply::status(502, "bad gateway"))
                .on("b.test", MockReply::ok_json("{}")),
        )
        .await;
        h.dispatcher
            .dispatch(ingress("gpt-4", false, &[(BACKEND_ID_HEADER, "a")]))
            .await
            .unwrap();
        let a_points = h.metrics.points_for_backend("a");
        let b_points = h.metrics.points_for_backend("b");
        assert_eq!(a_points.len(), 1);
        assert_eq!(b_points.len(), 1);
        assert_eq!(a_points[0].request_id, b_points[0].request_id);
    }

    #[test]
    fn test_fallback_candidates_rotation() {
        let m = model(
            "gpt-4",
            vec![backend("a"), backend("b"), backend("c"), backend("d")],
        );
        let order: Vec<String> = fallback_candidates(&m, m.backend("c").unwrap())
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(order, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_fallback_candidates_skip_disabled() {
        let mut b = backend("b");
        b.enabled = false;
        let m = model("gpt-4", vec![backend("a"), b, backend("c")]);
        let order: Vec<String> = fallback_candidates(&m, m.backend("a").unwrap())
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk-abc"));
        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
        headers.remove(AUTHORIZATION);
        assert_eq!(bearer_token(&headers), None);
    }
}
