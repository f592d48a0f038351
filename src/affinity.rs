//! Session-to-backend affinity: sticky routing for prompt-cache reuse.
//!
//! A bounded in-process LRU cache sits over a durable [`AffinityStore`].
//! Reads prefer the cache; misses consult the store and populate the cache.
//! Writes and access-time bumps are fire-and-forget — affinity is a routing
//! hint, never worth failing a request over. Mappings that resolve to a
//! backend that is gone, disabled, or weight-0 are purged.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config_store::{ConfigChange, ConfigStore};
use crate::error::{ProxyError, Result};
use crate::types::now_ms;

/// Default LRU capacity.
pub const AFFINITY_CACHE_CAPACITY: usize = 10_000;

/// One durable session pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityMapping {
    pub model: String,
    pub session_id: String,
    pub backend_id: String,
    pub created_at_ms: i64,
    pub last_accessed_at_ms: i64,
    pub access_count: u64,
}

/// Durable storage for affinity mappings.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    async fn get(&self, model: &str, session_id: &str) -> Result<Option<AffinityMapping>>;
    /// Create-or-refresh the pin for `(model, session_id)`.
    async fn upsert(&self, model: &str, session_id: &str, backend_id: &str) -> Result<()>;
    /// Bump `last_accessed_at` and `access_count`.
    async fn touch(&self, model: &str, session_id: &str) -> Result<()>;
    async fn remove(&self, model: &str, session_id: &str) -> Result<()>;
    /// Remove every pin referencing a backend; returns how many went away.
    async fn remove_backend(&self, model: &str, backend_id: &str) -> Result<u64>;
    /// Remove every pin under a model.
    async fn remove_model(&self, model: &str) -> Result<u64>;
}

/// In-memory store for standalone mode and tests.
#[derive(Default)]
pub struct MemoryAffinityStore {
    mappings: Mutex<std::collections::HashMap<(String, String), AffinityMapping>>,
}

impl MemoryAffinityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AffinityStore for MemoryAffinityStore {
    async fn get(&self, model: &str, session_id: &str) -> Result<Option<AffinityMapping>> {
        let mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mappings
            .get(&(model.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, model: &str, session_id: &str, backend_id: &str) -> Result<()> {
        let now = now_ms();
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        mappings
            .entry((model.to_string(), session_id.to_string()))
            .and_modify(|m| {
                m.backend_id = backend_id.to_string();
                m.last_accessed_at_ms = now;
                m.access_count += 1;
            })
            .or_insert_with(|| AffinityMapping {
                model: model.to_string(),
                session_id: session_id.to_string(),
                backend_id: backend_id.to_string(),
                created_at_ms: now,
                last_accessed_at_ms: now,
                access_count: 1,
            });
        Ok(())
    }

    async fn touch(&self, model: &str, session_id: &str) -> Result<()> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = mappings.get_mut(&(model.to_string(), session_id.to_string())) {
            m.last_accessed_at_ms = now_ms();
            m.access_count += 1;
        }
        Ok(())
    }

    async fn remove(&self, model: &str, session_id: &str) -> Result<()> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        mappings.remove(&(model.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn remove_backend(&self, model: &str, backend_id: &str) -> Result<u64> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        let before = mappings.len();
        mappings.retain(|(m, _), v| !(m == model && v.backend_id == backend_id));
        Ok((before - mappings.len()) as u64)
    }

    async fn remove_model(&self, model: &str) -> Result<u64> {
        let mut mappings = self.mappings.lock().unwrap_or_else(|e| e.into_inner());
        let before = mappings.len();
        mappings.retain(|(m, _), _| m != model);
        Ok((before - mappings.len()) as u64)
    }
}

/// MongoDB-backed store over the `affinity_mappings` collection.
pub struct MongoAffinityStore {
    collection: mongodb::Collection<AffinityMapping>,
}

fn storage_err(err: mongodb::error::Error) -> ProxyError {
    ProxyError::Storage(err.to_string())
}

impl MongoAffinityStore {
    pub fn new(db: &mongodb::Database) -> Self {
        Self {
            collection: db.collection("affinity_mappings"),
        }
    }
}

#[async_trait]
impl AffinityStore for MongoAffinityStore {
    async fn get(&self, model: &str, session_id: &str) -> Result<Option<AffinityMapping>> {
        self.collection
            .find_one(doc! { "model": model, "session_id": session_id })
            .await
            .map_err(storage_err)
    }

    async fn upsert(&self, model: &str, session_id: &str, backend_id: &str) -> Result<()> {
        let now = now_ms();
        self.collection
            .update_one(
                doc! { "model": model, "session_id": session_id },
                doc! {
                    "$set": { "backend_id": backend_id, "last_accessed_at_ms": now },
                    "$setOnInsert": { "created_at_ms": now },
                    "$inc": { "access_count": 1_i64 },
                },
            )
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn touch(&self, model: &str, session_id: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "model": model, "session_id": session_id },
                doc! {
                    "$set": { "last_accessed_at_ms": now_ms() },
                    "$inc": { "access_count": 1_i64 },
                },
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove(&self, model: &str, session_id: &str) -> Result<()> {
        self.collection
            .delete_one(doc! { "model": model, "session_id": session_id })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_backend(&self, model: &str, backend_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "model": model, "backend_id": backend_id })
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count)
    }

    async fn remove_model(&self, model: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "model": model })
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count)
    }
}

/// LRU cache over the durable store.
pub struct AffinityMap {
    cache: Mutex<LruCache<(String, String), String>>,
    store: Arc<dyn AffinityStore>,
}

impl AffinityMap {
    pub fn new(store: Arc<dyn AffinityStore>) -> Self {
        Self::with_capacity(store, AFFINITY_CACHE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn AffinityStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            store,
        }
    }

    /// Backend pinned to this session, if any. Bumps access metadata in the
    /// background on a hit.
    pub async fn resolve(&self, model: &str, session_id: &str) -> Option<String> {
        let key = (model.to_string(), session_id.to_string());
        let cached = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&key).cloned()
        };
        if let Some(backend_id) = cached {
            self.spawn_touch(model, session_id);
            return Some(backend_id);
        }

        match self.store.get(model, session_id).await {
            Ok(Some(mapping)) => {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.put(key, mapping.backend_id.clone());
                drop(cache);
                self.spawn_touch(model, session_id);
                Some(mapping.backend_id)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(model, session_id, error = %err, "affinity read failed");
                None
            }
        }
    }

    /// Pin (or re-pin) a session to a backend. The durable write is
    /// fire-and-forget.
    pub fn record(&self, model: &str, session_id: &str, backend_id: &str) {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(
                (model.to_string(), session_id.to_string()),
                backend_id.to_string(),
            );
        }
        let store = Arc::clone(&self.store);
        let (model, session_id, backend_id) =
            (model.to_string(), session_id.to_string(), backend_id.to_string());
        tokio::spawn(async move {
            if let Err(err) = store.upsert(&model, &session_id, &backend_id).await {
                warn!(model, session_id, error = %err, "affinity upsert failed");
            }
        });
    }

    /// Drop one stale mapping (cache and store).
    pub async fn invalidate(&self, model: &str, session_id: &str) {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.pop(&(model.to_string(), session_id.to_string()));
        }
        if let Err(err) = self.store.remove(model, session_id).await {
            warn!(model, session_id, error = %err, "affinity remove failed");
        }
    }

    /// Drop every mapping under a model that points at a backend.
    pub async fn purge_backend(&self, model: &str, backend_id: &str) {
        self.purge_cached(|(m, _), pinned| m == model && pinned == backend_id);
        match self.store.remove_backend(model, backend_id).await {
            Ok(0) => {}
            Ok(removed) => debug!(model, backend_id, removed, "purged affinity mappings"),
            Err(err) => warn!(model, backend_id, error = %err, "affinity purge failed"),
        }
    }

    /// Drop every mapping under a model.
    pub async fn purge_model(&self, model: &str) {
        self.purge_cached(|(m, _), _| m == model);
        if let Err(err) = self.store.remove_model(model).await {
            warn!(model, error = %err, "affinity model purge failed");
        }
    }

    fn purge_cached(&self, matches: impl Fn(&(String, String), &String) -> bool) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<(String, String)> = cache
            .iter()
            .filter(|entry| matches(entry.0, entry.1))
            .map(|entry| entry.0.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    fn spawn_touch(&self, model: &str, session_id: &str) {
        let store = Arc::clone(&self.store);
        let (model, session_id) = (model.to_string(), session_id.to_string());
        tokio::spawn(async move {
            if let Err(err) = store.touch(&model, &session_id).await {
                warn!(model, session_id, error = %err, "affinity touch failed");
            }
        });
    }
}

/// Purge affinity mappings when configuration changes strand them: a model
/// removed, or a backend disabled / removed / demoted to weight 0.
pub fn spawn_affinity_purge(
    config: Arc<ConfigStore>,
    affinity: Arc<AffinityMap>,
) -> tokio::task::JoinHandle<()> {
    let mut changes = config.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ConfigChange::ModelUpserted(name)) => {
                    if let Some(model) = config.get_model(&name).await {
                        for backend in &model.backends {
                            if !backend.is_selectable() {
                                affinity.purge_backend(&name, &backend.id).await;
                            }
                        }
                    }
                }
                Ok(ConfigChange::ModelRemoved(name)) => affinity.purge_model(&name).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "affinity purge lagged behind config changes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
