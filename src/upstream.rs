//! The HTTP seam between the dispatcher and upstream providers.
//!
//! [`UpstreamClient`] is the one place upstream I/O happens, so tests can
//! substitute [`MockUpstream`] and exercise the full dispatch pipeline —
//! admission, TTFT races, fallback, stream interruption — without a network.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;

use crate::error::{ProxyError, Result};

/// Sends a prepared request upstream and exposes the raw response.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<reqwest::Response>;
}

/// Production client over a shared `reqwest::Client` connection pool.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<reqwest::Response> {
        self.client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))
    }
}

/// One step of a scripted streaming body.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Pause before the next event (models a slow upstream).
    Delay(Duration),
    /// Emit bytes to the reader.
    Chunk(Bytes),
    /// Fail the stream mid-flight.
    Error(String),
}

/// Canned reply for one mock rule.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Full JSON body with the given status.
    Json { status: u16, body: String },
    /// Connection-level failure before any response.
    NetworkError(String),
    /// Streaming body that plays back the scripted events.
    Stream { status: u16, events: Vec<StreamEvent> },
}

impl MockReply {
    pub fn ok_json(body: &str) -> Self {
        MockReply::Json {
            status: 200,
            body: body.to_string(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        MockReply::Json {
            status,
            body: body.to_string(),
        }
    }

    /// A 200 SSE stream emitting each chunk immediately.
    pub fn stream(chunks: &[&str]) -> Self {
        MockReply::Stream {
            status: 200,
            events: chunks
                .iter()
                .map(|c| StreamEvent::Chunk(Bytes::from(c.to_string())))
                .collect(),
        }
    }
}

/// A test upstream that answers from URL-matched rules, in the spirit of a
/// canned-response mock backend: deterministic, no network, replies reusable
/// across calls.
#[derive(Default)]
pub struct MockUpstream {
    rules: Vec<(String, MockReply)>,
    fallback: Option<MockReply>,
    calls: Mutex<Vec<String>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any URL containing `needle` with `reply`.
    pub fn on(mut self, needle: &str, reply: MockReply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    /// Answer any unmatched URL with `reply` (default: network error).
    pub fn otherwise(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// URLs called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many calls hit URLs containing `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }

    fn build_response(reply: &MockReply) -> Result<reqwest::Response> {
        match reply {
            MockReply::Json { status, body } => {
                let response = http::Response::builder()
                    .status(*status)
                    .header(CONTENT_TYPE, "application/json")
                    .body(reqwest::Body::from(body.clone()))
                    .map_err(|e| ProxyError::Internal(e.to_string()))?;
                Ok(reqwest::Response::from(response))
            }
            MockReply::NetworkError(message) => Err(ProxyError::Network(message.clone())),
            MockReply::Stream { status, events } => {
                let events = events.clone();
                let stream = async_stream::stream! {
                    for event in events {
                        match event {
                            StreamEvent::Delay(delay) => tokio::time::sleep(delay).await,
                            StreamEvent::Chunk(bytes) => {
                                yield Ok::<Bytes, std::io::Error>(bytes);
                            }
                            StreamEvent::Error(message) => {
                                yield Err(std::io::Error::other(message));
                                return;
                            }
                        }
                    }
                };
                let response = http::Response::builder()
                    .status(*status)
                    .header(CONTENT_TYPE, "text/event-stream")
                    .body(reqwest::Body::wrap_stream(stream))
                    .map_err(|e| ProxyError::Internal(e.to_string()))?;
                Ok(reqwest::Response::from(response))
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn send(
        &self,
        url: &str,
        _headers: HeaderMap,
        _body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| url.contains(needle.as_str()))
            .map(|(_, reply)| reply)
            .or(self.fallback.as_ref());
        match reply {
            Some(reply) => Self::build_response(reply),
            None => Err(ProxyError::Network(format!("no mock rule for '{url}'"))),
        }
    }
}
