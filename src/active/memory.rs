//! In-process active-request store for standalone mode and tests.
//!
//! Counts are correct for a single instance only; multi-instance deployments
//! need the document or KV store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ActiveRequest, ActiveRequestStore};
use crate::error::Result;
use crate::types::now_ms;

#[derive(Default)]
pub struct MemoryActiveRequestStore {
    records: Mutex<HashMap<String, Vec<ActiveRequest>>>,
}

impl MemoryActiveRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<ActiveRequest>>) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut records)
    }
}

#[async_trait]
impl ActiveRequestStore for MemoryActiveRequestStore {
    async fn try_record_start(
        &self,
        backend_id: &str,
        request: &ActiveRequest,
        max_limit: Option<u32>,
    ) -> Result<bool> {
        let now = now_ms();
        Ok(self.with_records(|records| {
            let entry = records.entry(backend_id.to_string()).or_default();
            entry.retain(|r| !r.is_expired(now));
            match max_limit {
                Some(max) if entry.len() as u64 >= max as u64 => false,
                _ => {
                    entry.push(request.clone());
                    true
                }
            }
        }))
    }

    async fn record_start(&self, backend_id: &str, request: &ActiveRequest) -> Result<()> {
        self.with_records(|records| {
            records
                .entry(backend_id.to_string())
                .or_default()
                .push(request.clone());
        });
        Ok(())
    }

    async fn record_complete(&self, backend_id: &str, request_id: &str) -> Result<()> {
        self.with_records(|records| {
            if let Some(entry) = records.get_mut(backend_id) {
                entry.retain(|r| r.request_id != request_id);
            }
        });
        Ok(())
    }

    async fn get_count(&self, backend_id: &str) -> Result<u64> {
        let now = now_ms();
        Ok(self.with_records(|records| {
            records
                .get(backend_id)
                .map(|entry| entry.iter().filter(|r| !r.is_expired(now)).count() as u64)
                .unwrap_or(0)
        }))
    }

    async fn get_all_counts(&self) -> Result<HashMap<String, u64>> {
        let now = now_ms();
        Ok(self.with_records(|records| {
            records
                .iter()
                .map(|(backend, entry)| {
                    let live = entry.iter().filter(|r| !r.is_expired(now)).count() as u64;
                    (backend.clone(), live)
                })
                .filter(|(_, count)| *count > 0)
                .collect()
        }))
    }

    async fn cleanup_instance(&self, instance_id: &str) -> Result<()> {
        self.with_records(|records| {
            for entry in records.values_mut() {
                entry.retain(|r| r.instance_id != instance_id);
            }
        });
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let now = now_ms();
        Ok(self.with_records(|records| {
            let mut reaped = 0;
            for entry in records.values_mut() {
                let before = entry.len();
                entry.retain(|r| !r.is_expired(now));
                reaped += (before - entry.len()) as u64;
            }
            reaped
        }))
    }
}
