use std::sync::Arc;

use prompt_gateway::{
    api::{self, AppState},
    config::{Config, StoreBackend},
    registry::ApiKeyRegistry,
    store::{MemoryQuotaStore, QuotaStore, RedisQuotaStore, SqliteQuotaStore},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load configuration");

    // Initialize quota store
    let store: Arc<dyn QuotaStore> = match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory quota store; counters are not shared between instances");
            Arc::new(MemoryQuotaStore::new())
        }
        StoreBackend::Sqlite => Arc::new(
            SqliteQuotaStore::open(&config.sqlite_path).expect("Failed to open SQLite quota store"),
        ),
        StoreBackend::Redis => Arc::new(
            RedisQuotaStore::connect(&config.redis_url())
                .await
                .expect("Failed to connect to Redis quota store"),
        ),
    };

    // One registry for the whole process, shared by every handler
    let registry = Arc::new(ApiKeyRegistry::new(store, config.quota_policy()));
    let state = Arc::new(AppState { registry });

    let app = api::router(state);

    tracing::info!(
        store = ?config.store,
        refresh_interval_seconds = config.refresh_interval_seconds,
        default_usage_limit = config.default_usage_limit,
        "Starting server on {}",
        config.addr
    );

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
