//! Per-request outcome metrics: fire-and-forget writes, windowed reads.
//!
//! The dispatcher writes exactly one [`RequestMetric`] per request; the load
//! balancer reads recent per-backend aggregates during selection. A disabled
//! sink drops writes and returns zeroed stats — strategies that need metrics
//! are rejected at startup in that case.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::now_ms;

/// Default window consulted by metrics-driven selection strategies.
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Capacity of the in-memory ring; oldest points fall off first.
const MEMORY_SINK_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Streaming,
    NonStreaming,
}

/// One completed request, as written to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    pub instance_id: String,
    pub backend_id: String,
    pub timestamp_ms: i64,
    pub request_id: String,
    pub status: MetricStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<StreamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// Windowed per-backend aggregate, as read by the load balancer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub avg_streaming_ttft_ms: Option<f64>,
    pub avg_non_streaming_ttft_ms: Option<f64>,
}

impl BackendStats {
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failure as f64 / self.total as f64
        }
    }

    /// Average TTFT for the given mode, if any sample exists.
    pub fn avg_ttft_ms(&self, stream: bool) -> Option<f64> {
        if stream {
            self.avg_streaming_ttft_ms
        } else {
            self.avg_non_streaming_ttft_ms
        }
    }

    fn from_points<'a>(points: impl Iterator<Item = &'a RequestMetric>) -> Self {
        let mut stats = BackendStats::default();
        let mut streaming = (0u64, 0f64);
        let mut non_streaming = (0u64, 0f64);
        for point in points {
            stats.total += 1;
            match point.status {
                MetricStatus::Success => stats.success += 1,
                MetricStatus::Failure => stats.failure += 1,
            }
            if let (Some(ttft), Some(kind)) = (point.ttft_ms, point.stream_type) {
                match kind {
                    StreamType::Streaming => {
                        streaming.0 += 1;
                        streaming.1 += ttft as f64;
                    }
                    StreamType::NonStreaming => {
                        non_streaming.0 += 1;
                        non_streaming.1 += ttft as f64;
                    }
                }
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64;
        }
        if streaming.0 > 0 {
            stats.avg_streaming_ttft_ms = Some(streaming.1 / streaming.0 as f64);
        }
        if non_streaming.0 > 0 {
            stats.avg_non_streaming_ttft_ms = Some(non_streaming.1 / non_streaming.0 as f64);
        }
        stats
    }
}

/// Where per-request outcomes go. Writes must never block or fail the
/// request path.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Whether this sink actually retains data. Metrics-driven strategies
    /// require an enabled sink.
    fn enabled(&self) -> bool {
        true
    }

    /// Fire-and-forget write of one completed request.
    fn record_request_complete(&self, metric: RequestMetric);

    /// Aggregate for one backend over the trailing window.
    async fn get_recent_stats(&self, backend_id: &str, window: Duration) -> BackendStats;

    /// Aggregates for every backend seen in the trailing window.
    async fn get_all_stats(&self, window: Duration) -> HashMap<String, BackendStats>;
}

/// Bounded in-memory ring. The standalone default and the test sink.
#[derive(Default)]
pub struct MemoryMetricsSink {
    points: Mutex<VecDeque<RequestMetric>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All retained points for a request id (test observability).
    pub fn points_for_request(&self, request_id: &str) -> Vec<RequestMetric> {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points
            .iter()
            .filter(|p| p.request_id == request_id)
            .cloned()
            .collect()
    }

    /// All retained points for a backend (test observability).
    pub fn points_for_backend(&self, backend_id: &str) -> Vec<RequestMetric> {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points
            .iter()
            .filter(|p| p.backend_id == backend_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    fn record_request_complete(&self, metric: RequestMetric) {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        if points.len() >= MEMORY_SINK_CAPACITY {
            points.pop_front();
        }
        points.push_back(metric);
    }

    async fn get_recent_stats(&self, backend_id: &str, window: Duration) -> BackendStats {
        let cutoff = now_ms() - window.as_millis() as i64;
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        BackendStats::from_points(
            points
                .iter()
                .filter(|p| p.backend_id == backend_id && p.timestamp_ms >= cutoff),
        )
    }

    async fn get_all_stats(&self, window: Duration) -> HashMap<String, BackendStats> {
        let cutoff = now_ms() - window.as_millis() as i64;
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let mut grouped: HashMap<String, Vec<&RequestMetric>> = HashMap::new();
        for point in points.iter().filter(|p| p.timestamp_ms >= cutoff) {
            grouped
                .entry(point.backend_id.clone())
                .or_default()
                .push(point);
        }
        grouped
            .into_iter()
            .map(|(backend, points)| (backend, BackendStats::from_points(points.into_iter())))
            .collect()
    }
}

/// Sink used when `ENABLE_METRICS=false`: drops writes, returns zeroes.
pub struct DisabledMetricsSink;

#[async_trait]
impl MetricsSink for DisabledMetricsSink {
    fn enabled(&self) -> bool {
        false
    }

    fn record_request_complete(&self, _metric: RequestMetric) {}

    async fn get_recent_stats(&self, _backend_id: &str, _window: Duration) -> BackendStats {
        BackendStats::default()
    }

    async fn get_all_stats(&self, _window: Duration) -> HashMap<String, BackendStats> {
        HashMap::new()
    }
}

/// Durable sink over the `metrics_data_points` collection. Writes are
/// buffered through a channel and drained by one writer task so the request
/// path never waits on the database.
pub struct MongoMetricsSink {
    collection: mongodb::Collection<RequestMetric>,
    tx: tokio::sync::mpsc::UnboundedSender<RequestMetric>,
}

impl MongoMetricsSink {
    pub fn new(db: &mongodb::Database) -> Self {
        let collection: mongodb::Collection<RequestMetric> = db.collection("metrics_data_points");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RequestMetric>();
        let writer = collection.clone();
        tokio::spawn(async move {
            while let Some(metric) = rx.recv().await {
                if let Err(err) = writer.insert_one(&metric).await {
                    warn!(error = %err, "failed to persist metric point");
                }
            }
        });
        Self { collection, tx }
    }
}

#[async_trait]
impl MetricsSink for MongoMetricsSink {
    fn record_request_complete(&self, metric: RequestMetric) {
        if self.tx.send(metric).is_err() {
            warn!("metrics writer task is gone; dropping metric point");
        }
    }

    async fn get_recent_stats(&self, backend_id: &str, window: Duration) -> BackendStats {
        use futures::TryStreamExt;
        let cutoff = now_ms() - window.as_millis() as i64;
        let filter = doc! {
            "backend_id": backend_id,
            "timestamp_ms": { "$gte": cutoff },
        };
        let points: Vec<RequestMetric> = match self.collection.find(filter).await {
            Ok(cursor) => match cursor.try_collect().await {
                Ok(points) => points,
                Err(err) => {
                    warn!(error = %err, "failed to read metric points");
                    return BackendStats::default();
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to query metric points");
                return BackendStats::default();
            }
        };
        BackendStats::from_points(points.iter())
    }

    async fn get_all_stats(&self, window: Duration) -> HashMap<String, BackendStats> {
        use futures::TryStreamExt;
        let cutoff = now_ms() - window.as_millis() as i64;
        let filter = doc! { "timestamp_ms": { "$gte": cutoff } };
        let points: Vec<RequestMetric> = match self.collection.find(filter).await {
            Ok(cursor) => cursor.try_collect().await.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "failed to query metric points");
                return HashMap::new();
            }
        };
        let mut grouped: HashMap<String, Vec<RequestMetric>> = HashMap::new();
        for point in points {
            grouped
                .entry(point.backend_id.clone())
                .or_default()
                .push(point);
        }
        grouped
            .into_iter()
            .map(|(backend, points)| (backend, BackendStats::from_points(points.iter())))
            .collect()
    }
}
