use actix_web::{middleware::Logger, web, App, HttpServer};
use aggregator_service::{AppState, Config, LogFormat, StorageBackend};
use anyhow::{Context, Result};
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use event_dedup::{BatchProcessor, EventStore, MemoryEventStore, PgEventStore, MIGRATOR};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,actix_web=info,aggregator_service=debug,event_dedup=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn EventStore>> {
    match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; events are lost on restart");
            let store: Arc<dyn EventStore> =
                Arc::new(MemoryEventStore::with_lock_wait(config.lock_wait()));
            Ok(store)
        }
        StorageBackend::Postgres => {
            let mut cfg = DbPoolConfig::for_service("aggregator-service");
            if cfg.database_url.is_empty() {
                cfg.database_url = config.database_url.clone();
            }
            cfg.log_config();

            let db_pool = create_pg_pool(cfg)
                .await
                .context("Failed to create database pool")?;
            tracing::info!("Database pool created successfully");

            tracing::info!("Running database migrations...");
            MIGRATOR
                .run(&db_pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Migrations completed successfully");

            let store: Arc<dyn EventStore> =
                Arc::new(PgEventStore::with_lock_timeout(db_pool, config.lock_wait()));
            Ok(store)
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);
    config.validate()?;

    tracing::info!(
        backend = ?config.storage_backend,
        "Starting aggregator-service"
    );

    let store = build_store(&config).await?;
    if store
        .ensure_counters()
        .await
        .context("Failed to initialize stats")?
    {
        tracing::info!("Initialized stats row");
    }

    let state = AppState::new(BatchProcessor::new(store), &config);
    let max_payload_bytes = config.max_payload_bytes;

    tracing::info!(
        "Starting HTTP server on {}:{}",
        config.http_host,
        config.http_port
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(max_payload_bytes))
            .configure(aggregator_service::configure)
    })
    .bind((config.http_host.as_str(), config.http_port))
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")
}
