//! Distributed counter of in-flight requests, keyed by backend.
//!
//! Concurrency caps must hold across proxy instances, so admission goes
//! through a shared store with one atomic primitive:
//! [`ActiveRequestStore::try_record_start`] filters expired records and
//! appends the new one iff the live count is below the cap, in a single
//! server-side operation. Records carry a 10-minute TTL as a safety net for
//! crashed instances; a background sweep reaps them.
//!
//! Implementations: [`MemoryActiveRequestStore`] (standalone mode, tests),
//! [`MongoActiveRequestStore`] (document store, aggregation-pipeline update),
//! [`RedisActiveRequestStore`] (KV store, server-side script).

pub mod memory;
pub mod mongo;
pub mod redis;

pub use memory::MemoryActiveRequestStore;
pub use mongo::MongoActiveRequestStore;
pub use redis::RedisActiveRequestStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::now_ms;

/// Records older than this are considered leaked by a dead instance.
pub const ACTIVE_REQUEST_TTL: Duration = Duration::from_secs(600);

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One in-flight request on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRequest {
    pub request_id: String,
    pub instance_id: String,
    pub started_at_ms: i64,
}

impl ActiveRequest {
    pub fn new(request_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            instance_id: instance_id.into(),
            started_at_ms: now_ms(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.started_at_ms > ACTIVE_REQUEST_TTL.as_millis() as i64
    }
}

/// Shared store of in-flight requests. All mutation goes through these
/// primitives; callers never read-modify-write.
#[async_trait]
pub trait ActiveRequestStore: Send + Sync {
    /// Atomic compare-and-insert. With `max_limit` `None` this always inserts
    /// and returns `true`. Otherwise, in one server-side operation: drop
    /// expired records for this backend, then insert iff the live count is
    /// below the cap. Returns whether the insert happened.
    async fn try_record_start(
        &self,
        backend_id: &str,
        request: &ActiveRequest,
        max_limit: Option<u32>,
    ) -> Result<bool>;

    /// Unconditional insert, for uncapped backends.
    async fn record_start(&self, backend_id: &str, request: &ActiveRequest) -> Result<()>;

    /// Remove the record for a finished request. Idempotent.
    async fn record_complete(&self, backend_id: &str, request_id: &str) -> Result<()>;

    /// Live (non-expired) count for one backend.
    async fn get_count(&self, backend_id: &str) -> Result<u64>;

    /// Live counts for every backend with records.
    async fn get_all_counts(&self) -> Result<HashMap<String, u64>>;

    /// Remove every record owned by an instance (graceful shutdown).
    async fn cleanup_instance(&self, instance_id: &str) -> Result<()>;

    /// Remove expired records everywhere; returns how many were reaped.
    async fn sweep_expired(&self) -> Result<u64>;
}

/// Periodic TTL sweep. Runs until the returned handle is aborted.
pub fn spawn_sweeper(store: Arc<dyn ActiveRequestStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {}
                Ok(reaped) => debug!(reaped, "swept expired active-request records"),
                Err(err) => warn!(error = %err, "active-request sweep failed"),
            }
        }
    })
}
