//! Admission control over the active-request store.
//!
//! The cap is best-effort: if the coordination store errors during
//! admission, the request is admitted anyway (fail-open) — briefly exceeding
//! a cap beats dropping traffic on a storage hiccup. Release errors are
//! logged and swallowed; the TTL sweep reclaims anything that slips through.

use std::sync::Arc;

use tracing::warn;

use crate::active::{ActiveRequest, ActiveRequestStore};
use crate::types::BackendConfig;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AtCapacity,
}

pub struct ConcurrencyLimiter {
    store: Arc<dyn ActiveRequestStore>,
    instance_id: String,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn ActiveRequestStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Try to take a slot on the backend. Uncapped backends always admit.
    pub async fn try_acquire(&self, backend: &BackendConfig, request_id: &str) -> Admission {
        let record = ActiveRequest::new(request_id, self.instance_id.clone());
        match self
            .store
            .try_record_start(&backend.id, &record, backend.concurrency_cap())
            .await
        {
            Ok(true) => Admission::Admitted,
            Ok(false) => Admission::AtCapacity,
            Err(err) => {
                warn!(
                    backend_id = %backend.id,
                    error = %err,
                    "active-request store error during admission; failing open"
                );
                Admission::Admitted
            }
        }
    }

    /// Return a slot. Never fails from the caller's perspective.
    pub async fn release(&self, backend_id: &str, request_id: &str) {
        if let Err(err) = self.store.record_complete(backend_id, request_id).await {
            warn!(
                backend_id = %backend_id,
                request_id = %request_id,
                error = %err,
                "failed to release admission; TTL sweep will reclaim it"
            );
        }
    }
}
