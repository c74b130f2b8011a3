// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use exam_engine::cache::{MemoryCache, NoopCache, PoolCache, RedisCache};
use exam_engine::config::{CacheBackend, Config};
use exam_engine::engine::{EngineOptions, ExamEngine};
use exam_engine::routes;
use exam_engine::state::AppState;
use exam_engine::store::PgStore;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file (if present)
    dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env()?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Initialize Database Pool with Retry
    let mut retry_count = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    tracing::error!("Failed to connect to database after 5 retries: {}", e);
                    return Err(e.into());
                }
                tracing::warn!("Database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations applied successfully.");

    let cache = build_cache(&config).await;
    tracing::info!("Pool cache backend: {}", cache.backend());

    let engine = ExamEngine::new(
        Arc::new(PgStore::new(pool)),
        cache,
        EngineOptions::from(&config),
    );

    // Create AppState
    let state = AppState {
        engine: Arc::new(engine),
        config: config.clone(),
    };

    // Create the Axum application router
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);

    // Start the server
    axum::serve(listener, app).await?;
    Ok(())
}

/// Redis when configured, otherwise the backend named by `CACHE_BACKEND`.
/// An unreachable Redis disables caching rather than splitting it per process.
async fn build_cache(config: &Config) -> Arc<dyn PoolCache> {
    if let Some(url) = &config.redis_url {
        return match RedisCache::connect(url).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::warn!("Redis unavailable, serving without a pool cache: {}", e);
                Arc::new(NoopCache)
            }
        };
    }

    match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::None => Arc::new(NoopCache),
    }
}
