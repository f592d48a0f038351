//! # LLM Proxy
//!
//! Reverse proxy for LLM chat-completion APIs: one client-visible model
//! fronts several upstream backends with distinct credentials, regions, and
//! capacity.
//!
//! The core is the dispatch pipeline: backend selection (weighted,
//! metrics-driven, or session-affine), per-backend concurrency admission
//! backed by a distributed counter, streaming pass-through with
//! time-to-first-token deadlines, and cascading fallback across backends on
//! failure or slowness.
//!
//! ## Core Concepts
//!
//! - **[`Dispatcher`]** — orchestrates one request: authorize → select →
//!   admit → forward → stream/parse → fall back. Composed from explicit
//!   dependencies at startup; every dependency has an in-memory
//!   implementation for tests and standalone mode.
//! - **[`ConfigStore`]** — in-memory snapshot of model/backend/API-key
//!   configuration over a durable store, with change notification.
//! - **[`ActiveRequestStore`]** — distributed set of in-flight requests that
//!   makes `max_concurrent_requests` hold across proxy instances.
//! - **[`LoadBalancer`]** — explicit override → session affinity → strategy
//!   (`weighted`, `lowest-ttft`, `min-error-rate`).
//! - **[`ProviderAdapter`]** — per-provider URL/header/body preparation and
//!   chunk framing (OpenAI-style text SSE, Bedrock binary event stream).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_proxy::{ConfigStore, Dispatcher, MemoryConfigStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(ConfigStore::load(Arc::new(MemoryConfigStore::new())).await?);
//!     let dispatcher = Arc::new(Dispatcher::builder(config).build());
//!
//!     let app = llm_proxy::server::router(dispatcher);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:51818").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod active;
pub mod affinity;
pub mod balancer;
pub mod config_store;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod provider;
pub mod recorder;
pub mod server;
pub mod settings;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use active::{
    spawn_sweeper, ActiveRequest, ActiveRequestStore, MemoryActiveRequestStore,
    MongoActiveRequestStore, RedisActiveRequestStore,
};
pub use affinity::{spawn_affinity_purge, AffinityMap, AffinityStore, MemoryAffinityStore};
pub use balancer::{validate_strategies, LoadBalancer};
pub use config_store::{ConfigBackingStore, ConfigChange, ConfigStore, MemoryConfigStore};
pub use dispatcher::{DispatchOutcome, Dispatcher, IngressRequest, OutcomeBody};
pub use error::{ProxyError, Result};
pub use limiter::{Admission, ConcurrencyLimiter};
pub use metrics::{
    BackendStats, DisabledMetricsSink, MemoryMetricsSink, MetricsSink, MongoMetricsSink,
    RequestMetric,
};
pub use provider::{BedrockAdapter, OpenAiAdapter, ProviderAdapter, ProviderRegistry};
pub use recorder::{MemoryRequestRecorder, NoopRequestRecorder, RequestRecorder};
pub use settings::{ActiveRequestStoreType, Settings};
pub use types::{ApiKeyConfig, BackendConfig, ModelConfig, ProviderKind, Strategy};
pub use upstream::{HttpUpstreamClient, MockUpstream, UpstreamClient};
