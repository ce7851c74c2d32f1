//! Database connection pool management
//!
//! Provides pool creation and configuration for the aggregator. The initial
//! connection is retried a bounded number of times so the service survives a
//! database that is still starting up (docker-compose, k8s init ordering).

mod metrics;

use metrics::{record_connect_retry, update_pool_metrics};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Database connection pool configuration
#[derive(Clone)]
pub struct DbConfig {
    /// Service name for metrics labeling
    pub service_name: String,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Timeout for the `SELECT 1` verification of a fresh pool
    pub connect_timeout_secs: u64,
    /// Connection acquisition timeout (get connection from pool)
    pub acquire_timeout_secs: u64,
    /// Connection idle timeout
    pub idle_timeout_secs: u64,
    /// Connection maximum lifetime
    pub max_lifetime_secs: u64,
    /// Extra attempts after the first failed connect
    pub connect_retries: u32,
    /// Fixed delay between connect attempts
    pub connect_retry_delay_secs: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .field("connect_retries", &self.connect_retries)
            .field("connect_retry_delay_secs", &self.connect_retry_delay_secs)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("unknown"),
            database_url: String::new(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout_secs: 5,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            connect_retries: 5,
            connect_retry_delay_secs: 2,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl DbConfig {
    /// Create DbConfig sized for a specific service.
    ///
    /// The ingest path holds one connection per in-flight batch for the whole
    /// batch transaction, so the aggregator gets a larger share than readers.
    pub fn for_service(service_name: &str) -> Self {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_default();

        let (max, min) = match service_name {
            "aggregator-service" => (20, 2),
            _ => (5, 1),
        };

        Self {
            service_name: service_name.to_string(),
            database_url,
            max_connections: max,
            min_connections: min,
            ..Self::default()
        }
        .with_env_overrides()
    }

    fn with_env_overrides(self) -> Self {
        Self {
            max_connections: env_or("DB_MAX_CONNECTIONS", self.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", self.min_connections),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", self.connect_timeout_secs),
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", self.acquire_timeout_secs),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", self.idle_timeout_secs),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", self.max_lifetime_secs),
            connect_retries: env_or("DB_CONNECT_RETRIES", self.connect_retries),
            connect_retry_delay_secs: env_or(
                "DB_CONNECT_RETRY_DELAY_SECS",
                self.connect_retry_delay_secs,
            ),
            ..self
        }
    }

    /// Log pool configuration details
    pub fn log_config(&self) {
        info!(
            "Database Pool Configuration: \
             max_connections={}, min_connections={}, \
             connect_timeout={}s, acquire_timeout={}s, idle_timeout={}s, max_lifetime={}s, \
             connect_retries={}",
            self.max_connections,
            self.min_connections,
            self.connect_timeout_secs,
            self.acquire_timeout_secs,
            self.idle_timeout_secs,
            self.max_lifetime_secs,
            self.connect_retries
        );
    }
}

/// Create a PostgreSQL connection pool with automatic metrics monitoring.
///
/// Connecting is attempted `1 + connect_retries` times with a fixed delay in
/// between. The last error is returned once attempts are exhausted.
pub async fn create_pool(config: DbConfig) -> Result<PgPool, sqlx::Error> {
    debug!(
        "Creating database pool: service={}, max={}, min={}, \
         acquire_timeout={}s, verify_timeout={}s, idle_timeout={}s",
        config.service_name,
        config.max_connections,
        config.min_connections,
        config.acquire_timeout_secs,
        config.connect_timeout_secs,
        config.idle_timeout_secs
    );

    let mut attempt = 0;
    let pool = loop {
        match connect_once(&config).await {
            Ok(pool) => break pool,
            Err(e) if attempt < config.connect_retries => {
                attempt += 1;
                record_connect_retry(&config.service_name);
                warn!(
                    service = %config.service_name,
                    attempt,
                    max_retries = config.connect_retries,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(config.connect_retry_delay_secs)).await;
            }
            Err(e) => {
                error!(
                    service = %config.service_name,
                    attempts = attempt + 1,
                    error = %e,
                    "Database connection failed, giving up"
                );
                return Err(e);
            }
        }
    };

    info!(
        service = %config.service_name,
        "Database pool created and verified successfully"
    );

    update_pool_metrics(&pool, &config.service_name);

    {
        let pool_clone = pool.clone();
        let service = config.service_name.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                update_pool_metrics(&pool_clone, &service);
            }
        });
    }

    Ok(pool)
}

async fn connect_once(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        // Timeout for acquiring a connection from the pool
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        // Close connections idle for longer than this
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        // Maximum lifetime of a connection (to handle stale connections)
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await?;

    match tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    {
        Ok(Ok(_)) => Ok(pool),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "Database verification timeout",
        ))),
    }
}
