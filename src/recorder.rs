//! Fire-and-forget recording of built upstream requests.
//!
//! Backends with `record_requests` set hand each built request to the
//! recorder just before it goes upstream. Recording failures are logged and
//! never reach the request path.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Snapshot of one upstream request as it left the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub request_id: String,
    pub backend_id: String,
    pub model: String,
    pub url: String,
    pub timestamp_ms: i64,
    pub body: serde_json::Value,
}

pub trait RequestRecorder: Send + Sync {
    /// Non-blocking hand-off of one request snapshot.
    fn record(&self, request: RecordedRequest);
}

/// Discards everything; the default when recording is not configured.
pub struct NoopRequestRecorder;

impl RequestRecorder for NoopRequestRecorder {
    fn record(&self, _request: RecordedRequest) {}
}

/// Keeps snapshots in memory (standalone mode, tests).
#[derive(Default)]
pub struct MemoryRequestRecorder {
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryRequestRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl RequestRecorder for MemoryRequestRecorder {
    fn record(&self, request: RecordedRequest) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }
}

/// Persists snapshots to the `recorded_requests` collection through a
/// buffered writer task.
pub struct MongoRequestRecorder {
    tx: tokio::sync::mpsc::UnboundedSender<RecordedRequest>,
}

impl MongoRequestRecorder {
    pub fn new(db: &mongodb::Database) -> Self {
        let collection: mongodb::Collection<RecordedRequest> = db.collection("recorded_requests");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RecordedRequest>();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(err) = collection.insert_one(&request).await {
                    warn!(error = %err, "failed to persist recorded request");
                }
            }
        });
        Self { tx }
    }
}

impl RequestRecorder for MongoRequestRecorder {
    fn record(&self, request: RecordedRequest) {
        if self.tx.send(request).is_err() {
            warn!("request recorder writer task is gone; dropping snapshot");
        }
    }
}
