//! Composition root: wire settings, stores, dispatcher, and the listener.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use llm_proxy::affinity::{AffinityStore, MemoryAffinityStore, MongoAffinityStore};
use llm_proxy::config_store::MongoConfigStore;
use llm_proxy::metrics::MongoMetricsSink;
use llm_proxy::recorder::{MongoRequestRecorder, NoopRequestRecorder, RequestRecorder};
use llm_proxy::{
    spawn_affinity_purge, spawn_sweeper, validate_strategies, ActiveRequestStore,
    ActiveRequestStoreType, ConfigBackingStore, ConfigStore, DisabledMetricsSink, Dispatcher,
    MemoryActiveRequestStore, MemoryConfigStore, MemoryMetricsSink, MetricsSink,
    MongoActiveRequestStore, RedisActiveRequestStore, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("reading settings from the environment")?;
    let instance_id = Uuid::new_v4().to_string();

    let database = match &settings.mongodb_url {
        Some(url) => {
            let client = mongodb::Client::with_uri_str(url)
                .await
                .context("connecting to MongoDB")?;
            Some(client.database(&settings.mongodb_database))
        }
        None => {
            info!("MONGODB_URL not set; running standalone on in-memory stores");
            None
        }
    };

    let config_backing: Arc<dyn ConfigBackingStore> = match &database {
        Some(db) => Arc::new(MongoConfigStore::new(db)),
        None => Arc::new(MemoryConfigStore::new()),
    };
    let config = Arc::new(
        ConfigStore::load(config_backing)
            .await
            .context("loading configuration")?,
    );

    let metrics: Arc<dyn MetricsSink> = if !settings.enable_metrics {
        Arc::new(DisabledMetricsSink)
    } else {
        match &database {
            Some(db) => Arc::new(MongoMetricsSink::new(db)),
            None => Arc::new(MemoryMetricsSink::new()),
        }
    };
    validate_strategies(&config, metrics.as_ref())
        .await
        .context("validating model strategies")?;

    let active_requests: Arc<dyn ActiveRequestStore> = match settings.active_request_store {
        ActiveRequestStoreType::Kv => {
            let url = settings
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the kv active-request store")?;
            Arc::new(
                RedisActiveRequestStore::connect(url)
                    .await
                    .context("connecting to Redis")?,
            )
        }
        ActiveRequestStoreType::Document => match &database {
            Some(db) => Arc::new(MongoActiveRequestStore::new(db)),
            None => Arc::new(MemoryActiveRequestStore::new()),
        },
    };
    let sweeper = spawn_sweeper(Arc::clone(&active_requests));

    let affinity_store: Arc<dyn AffinityStore> = match &database {
        Some(db) => Arc::new(MongoAffinityStore::new(db)),
        None => Arc::new(MemoryAffinityStore::new()),
    };
    let recorder: Arc<dyn RequestRecorder> = match &database {
        Some(db) => Arc::new(MongoRequestRecorder::new(db)),
        None => Arc::new(NoopRequestRecorder),
    };

    let dispatcher = Arc::new(
        Dispatcher::builder(Arc::clone(&config))
            .metrics(metrics)
            .active_requests(Arc::clone(&active_requests))
            .affinity_store(affinity_store)
            .recorder(recorder)
            .instance_id(instance_id.clone())
            .build(),
    );
    let purge = spawn_affinity_purge(Arc::clone(&config), dispatcher.affinity());

    let app = llm_proxy::server::router(dispatcher);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("binding port {}", settings.port))?;
    info!(port = settings.port, instance_id = %instance_id, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    sweeper.abort();
    purge.abort();
    if let Err(err) = active_requests.cleanup_instance(&instance_id).await {
        warn!(error = %err, "failed to clean up active-request records on shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c; draining"),
        _ = terminate => info!("received SIGTERM; draining"),
    }
}
