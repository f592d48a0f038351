//! Source of truth for model, backend, and API-key configuration.
//!
//! [`ConfigStore`] keeps an in-memory snapshot over a durable
//! [`ConfigBackingStore`]. Reads are served from the snapshot only; mutations
//! write through to the backing store and update the snapshot optimistically,
//! so a read following a write observes the new state without waiting on the
//! change-notification channel. If the backing store is unreachable the
//! snapshot keeps serving reads and writes fail.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::error::{ProxyError, Result};
use crate::types::{ApiKeyConfig, BackendConfig, ModelConfig};

/// Configuration change events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    ModelUpserted(String),
    ModelRemoved(String),
    ApiKeyUpserted(String),
    ApiKeyRemoved(String),
}

/// Durable storage behind the in-memory snapshot.
#[async_trait]
pub trait ConfigBackingStore: Send + Sync {
    async fn load_models(&self) -> Result<Vec<ModelConfig>>;
    async fn load_api_keys(&self) -> Result<Vec<ApiKeyConfig>>;
    async fn upsert_model(&self, model: &ModelConfig) -> Result<()>;
    async fn remove_model(&self, name: &str) -> Result<()>;
    async fn upsert_api_key(&self, key: &ApiKeyConfig) -> Result<()>;
    async fn remove_api_key(&self, key: &str) -> Result<()>;
}

/// In-memory backing store for standalone mode and tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    models: std::sync::Mutex<HashMap<String, ModelConfig>>,
    api_keys: std::sync::Mutex<HashMap<String, ApiKeyConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed with models and keys (used by tests and standalone boots).
    pub fn seeded(models: Vec<ModelConfig>, api_keys: Vec<ApiKeyConfig>) -> Self {
        let store = Self::new();
        {
            let mut m = store.models.lock().unwrap_or_else(|e| e.into_inner());
            for model in models {
                m.insert(model.model.clone(), model);
            }
        }
        {
            let mut k = store.api_keys.lock().unwrap_or_else(|e| e.into_inner());
            for key in api_keys {
                k.insert(key.key.clone(), key);
            }
        }
        store
    }
}

#[async_trait]
impl ConfigBackingStore for MemoryConfigStore {
    async fn load_models(&self) -> Result<Vec<ModelConfig>> {
        let models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        Ok(models.values().cloned().collect())
    }

    async fn load_api_keys(&self) -> Result<Vec<ApiKeyConfig>> {
        let keys = self.api_keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.values().cloned().collect())
    }

    async fn upsert_model(&self, model: &ModelConfig) -> Result<()> {
        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        models.insert(model.model.clone(), model.clone());
        Ok(())
    }

    async fn remove_model(&self, name: &str) -> Result<()> {
        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        models.remove(name);
        Ok(())
    }

    async fn upsert_api_key(&self, key: &ApiKeyConfig) -> Result<()> {
        let mut keys = self.api_keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(key.key.clone(), key.clone());
        Ok(())
    }

    async fn remove_api_key(&self, key: &str) -> Result<()> {
        let mut keys = self.api_keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(key);
        Ok(())
    }
}

/// MongoDB-backed configuration store (`models` and `api_keys` collections).
pub struct MongoConfigStore {
    models: mongodb::Collection<ModelConfig>,
    api_keys: mongodb::Collection<ApiKeyConfig>,
}

impl MongoConfigStore {
    pub fn new(db: &mongodb::Database) -> Self {
        Self {
            models: db.collection("models"),
            api_keys: db.collection("api_keys"),
        }
    }
}

fn storage_err(err: mongodb::error::Error) -> ProxyError {
    ProxyError::Storage(err.to_string())
}

#[async_trait]
impl ConfigBackingStore for MongoConfigStore {
    async fn load_models(&self) -> Result<Vec<ModelConfig>> {
        let cursor = self.models.find(doc! {}).await.map_err(storage_err)?;
        cursor.try_collect().await.map_err(storage_err)
    }

    async fn load_api_keys(&self) -> Result<Vec<ApiKeyConfig>> {
        let cursor = self.api_keys.find(doc! {}).await.map_err(storage_err)?;
        cursor.try_collect().await.map_err(storage_err)
    }

    async fn upsert_model(&self, model: &ModelConfig) -> Result<()> {
        self.models
            .replace_one(doc! { "model": &model.model }, model)
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_model(&self, name: &str) -> Result<()> {
        self.models
            .delete_one(doc! { "model": name })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn upsert_api_key(&self, key: &ApiKeyConfig) -> Result<()> {
        self.api_keys
            .replace_one(doc! { "key": &key.key }, key)
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_api_key(&self, key: &str) -> Result<()> {
        self.api_keys
            .delete_one(doc! { "key": key })
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

/// In-memory snapshot + write-through mutations + change notification.
pub struct ConfigStore {
    models: RwLock<HashMap<String, Arc<ModelConfig>>>,
    api_keys: RwLock<HashMap<String, Arc<ApiKeyConfig>>>,
    backing: Arc<dyn ConfigBackingStore>,
    changes: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    /// Load the initial snapshot from the backing store.
    pub async fn load(backing: Arc<dyn ConfigBackingStore>) -> Result<Self> {
        let mut models = HashMap::new();
        for model in backing.load_models().await? {
            model.validate()?;
            models.insert(model.model.clone(), Arc::new(model));
        }
        let mut api_keys = HashMap::new();
        for key in backing.load_api_keys().await? {
            api_keys.insert(key.key.clone(), Arc::new(key));
        }
        info!(
            models = models.len(),
            api_keys = api_keys.len(),
            "configuration loaded"
        );
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            models: RwLock::new(models),
            api_keys: RwLock::new(api_keys),
            backing,
            changes,
        })
    }

    pub async fn get_model(&self, name: &str) -> Option<Arc<ModelConfig>> {
        self.models.read().await.get(name).cloned()
    }

    pub async fn list_models(&self) -> Vec<Arc<ModelConfig>> {
        self.models.read().await.values().cloned().collect()
    }

    /// Enabled backends of a model, in config order.
    pub async fn enabled_backends(&self, name: &str) -> Vec<BackendConfig> {
        match self.get_model(name).await {
            Some(model) => model.enabled_backends().into_iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Enabled backends with positive weight, in config order.
    pub async fn selectable_backends(&self, name: &str) -> Vec<BackendConfig> {
        match self.get_model(name).await {
            Some(model) => model.selectable_backends().into_iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn get_backend(&self, model: &str, backend_id: &str) -> Option<BackendConfig> {
        self.get_model(model)
            .await
            .and_then(|m| m.backend(backend_id).cloned())
    }

    pub async fn get_api_key(&self, key: &str) -> Option<Arc<ApiKeyConfig>> {
        self.api_keys.read().await.get(key).cloned()
    }

    /// Validate, write through, then update the snapshot and notify.
    pub async fn upsert_model(&self, model: ModelConfig) -> Result<()> {
        model.validate()?;
        self.backing.upsert_model(&model).await?;
        let name = model.model.clone();
        self.models
            .write()
            .await
            .insert(name.clone(), Arc::new(model));
        let _ = self.changes.send(ConfigChange::ModelUpserted(name));
        Ok(())
    }

    pub async fn remove_model(&self, name: &str) -> Result<()> {
        self.backing.remove_model(name).await?;
        self.models.write().await.remove(name);
        let _ = self.changes.send(ConfigChange::ModelRemoved(name.to_string()));
        Ok(())
    }

    pub async fn upsert_api_key(&self, key: ApiKeyConfig) -> Result<()> {
        self.backing.upsert_api_key(&key).await?;
        let id = key.key.clone();
        self.api_keys.write().await.insert(id.clone(), Arc::new(key));
        let _ = self.changes.send(ConfigChange::ApiKeyUpserted(id));
        Ok(())
    }

    pub async fn remove_api_key(&self, key: &str) -> Result<()> {
        self.backing.remove_api_key(key).await?;
        self.api_keys.write().await.remove(key);
        let _ = self.changes.send(ConfigChange::ApiKeyRemoved(key.to_string()));
        Ok(())
    }

    /// Subscribe to configuration changes made through this store.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}
