//! Process settings read from the environment at startup.

use crate::error::{ProxyError, Result};

/// Which active-request store implementation backs the distributed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRequestStoreType {
    /// Per-backend document with an atomic filter-then-append pipeline.
    Document,
    /// Per-backend sorted set guarded by a server-side script.
    Kv,
}

/// Startup configuration. All values come from the environment; parse
/// failures abort startup before the listener binds.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen port. `PORT`, default 51818.
    pub port: u16,
    /// Metrics sink toggle. `ENABLE_METRICS`, default true.
    pub enable_metrics: bool,
    /// Active-request store flavor. `ACTIVE_REQUEST_STORE_TYPE`, default
    /// `document`.
    pub active_request_store: ActiveRequestStoreType,
    /// Document store URL. Absent forces in-memory standalone mode for every
    /// durable store.
    pub mongodb_url: Option<String>,
    /// Database name. `MONGODB_DATABASE`, default `llm_proxy`.
    pub mongodb_database: String,
    /// KV store URL. Required when the store type is `kv`.
    pub redis_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConfig(format!("PORT '{raw}' is not a port")))?,
            Err(_) => 51818,
        };

        let enable_metrics = match std::env::var("ENABLE_METRICS") {
            Ok(raw) => parse_bool(&raw)
                .ok_or_else(|| ProxyError::InvalidConfig(format!("ENABLE_METRICS '{raw}'")))?,
            Err(_) => true,
        };

        let active_request_store = match std::env::var("ACTIVE_REQUEST_STORE_TYPE") {
            Ok(raw) => match raw.as_str() {
                "document" => ActiveRequestStoreType::Document,
                "kv" => ActiveRequestStoreType::Kv,
                other => {
                    return Err(ProxyError::InvalidConfig(format!(
                        "ACTIVE_REQUEST_STORE_TYPE '{other}' (expected 'document' or 'kv')"
                    )))
                }
            },
            Err(_) => ActiveRequestStoreType::Document,
        };

        let mongodb_url = std::env::var("MONGODB_URL").ok().filter(|v| !v.is_empty());
        let redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        let mongodb_database =
            std::env::var("MONGODB_DATABASE").unwrap_or_else(|_| "llm_proxy".into());

        if active_request_store == ActiveRequestStoreType::Kv && redis_url.is_none() {
            return Err(ProxyError::InvalidConfig(
                "ACTIVE_REQUEST_STORE_TYPE=kv requires REDIS_URL".into(),
            ));
        }

        Ok(Self {
            port,
            enable_metrics,
            active_request_store,
            mongodb_url,
            mongodb_database,
            redis_url,
        })
    }

    /// Standalone mode: no document store configured, so every durable store
    /// runs in memory and concurrency caps are per-instance only.
    pub fn standalone(&self) -> bool {
        self.mongodb_url.is_none()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
