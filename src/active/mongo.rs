//! Document-store active-request counter.
//!
//! One document per backend holds the array of in-flight requests. Admission
//! runs as a single `find_one_and_update` with an aggregation-pipeline
//! update: filter out expired entries, then append the new entry iff the
//! remaining count is below the cap. The returned document tells us whether
//! the append happened. No application-level read-then-write.

use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};

use super::{ActiveRequest, ActiveRequestStore, ACTIVE_REQUEST_TTL};
use crate::error::{ProxyError, Result};
use crate::types::now_ms;

#[derive(Debug, Serialize, Deserialize)]
struct BackendRecordDoc {
    #[serde(rename = "_id")]
    backend_id: String,
    #[serde(default)]
    requests: Vec<ActiveRequest>,
}

pub struct MongoActiveRequestStore {
    collection: mongodb::Collection<BackendRecordDoc>,
}

fn storage_err(err: mongodb::error::Error) -> ProxyError {
    ProxyError::Storage(err.to_string())
}

fn ttl_cutoff() -> i64 {
    now_ms() - ACTIVE_REQUEST_TTL.as_millis() as i64
}

impl MongoActiveRequestStore {
    pub fn new(db: &mongodb::Database) -> Self {
        Self {
            collection: db.collection("active_requests"),
        }
    }

    /// The filter-expired-then-append-if-below-cap pipeline.
    fn admit_pipeline(request: &ActiveRequest, max: u32, cutoff: i64) -> Result<Vec<Document>> {
        let entry = to_bson(request).map_err(|e| ProxyError::Internal(e.to_string()))?;
        Ok(vec![doc! {
            "$set": {
                "requests": {
                    "$let": {
                        "vars": {
                            "live": {
                                "$filter": {
                                    "input": { "$ifNull": ["$requests", []] },
                                    "as": "req",
                                    "cond": { "$gt": ["$$req.started_at_ms", cutoff] }
                                }
                            }
                        },
                        "in": {
                            "$cond": [
                                { "$lt": [{ "$size": "$$live" }, max as i64] },
                                { "$concatArrays": ["$$live", [entry]] },
                                "$$live"
                            ]
                        }
                    }
                }
            }
        }])
    }
}

#[async_trait]
impl ActiveRequestStore for MongoActiveRequestStore {
    async fn try_record_start(
        &self,
        backend_id: &str,
        request: &ActiveRequest,
        max_limit: Option<u32>,
    ) -> Result<bool> {
        let Some(max) = max_limit else {
            self.record_start(backend_id, request).await?;
            return Ok(true);
        };

        let pipeline = Self::admit_pipeline(request, max, ttl_cutoff())?;
        let updated = self
            .collection
            .find_one_and_update(doc! { "_id": backend_id }, pipeline)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(storage_err)?;

        Ok(updated
            .map(|d| d.requests.iter().any(|r| r.request_id == request.request_id))
            .unwrap_or(false))
    }

    async fn record_start(&self, backend_id: &str, request: &ActiveRequest) -> Result<()> {
        let entry = to_bson(request).map_err(|e| ProxyError::Internal(e.to_string()))?;
        self.collection
            .update_one(
                doc! { "_id": backend_id },
                doc! { "$push": { "requests": entry } },
            )
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn record_complete(&self, backend_id: &str, request_id: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": backend_id },
                doc! { "$pull": { "requests": { "request_id": request_id } } },
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_count(&self, backend_id: &str) -> Result<u64> {
        let cutoff = ttl_cutoff();
        let record = self
            .collection
            .find_one(doc! { "_id": backend_id })
            .await
            .map_err(storage_err)?;
        Ok(record
            .map(|d| {
                d.requests
                    .iter()
                    .filter(|r| r.started_at_ms > cutoff)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn get_all_counts(&self) -> Result<HashMap<String, u64>> {
        use futures::TryStreamExt;
        let cutoff = ttl_cutoff();
        let cursor = self.collection.find(doc! {}).await.map_err(storage_err)?;
        let records: Vec<BackendRecordDoc> = cursor.try_collect().await.map_err(storage_err)?;
        Ok(records
            .into_iter()
            .map(|d| {
                let live = d
                    .requests
                    .iter()
                    .filter(|r| r.started_at_ms > cutoff)
                    .count() as u64;
                (d.backend_id, live)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn cleanup_instance(&self, instance_id: &str) -> Result<()> {
        self.collection
            .update_many(
                doc! {},
                doc! { "$pull": { "requests": { "instance_id": instance_id } } },
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let cutoff = ttl_cutoff();
        let result = self
            .collection
            .update_many(
                doc! {},
                doc! { "$pull": { "requests": { "started_at_ms": { "$lte": cutoff } } } },
            )
            .await
            .map_err(storage_err)?;
        Ok(result.modified_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_pipeline_shape() {
        let request = ActiveRequest::new("req-1", "inst-1");
        let pipeline = MongoActiveRequestStore::admit_pipeline(&request, 5, 1000).unwrap();
        assert_eq!(pipeline.len(), 1);
        let set = pipeline[0].get_document("$set").unwrap();
        // The update must both filter expired entries and gate the append on
        // the live count, in one stage.
        let rendered = format!("{set}");
        assert!(rendered.contains("$filter"));
        assert!(rendered.contains("$concatArrays"));
        assert!(rendered.contains("$size"));
    }
}
