use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // HTTP server config
    pub http_host: String,
    pub http_port: u16,
    pub max_payload_bytes: usize,

    // Storage
    pub storage_backend: StorageBackend,
    pub database_url: String,
    pub lock_wait_timeout_ms: u64,

    // Listing
    pub default_list_limit: i64,
    pub max_list_limit: i64,

    // Observability
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("http_host", "0.0.0.0")?
            .set_default("http_port", 8000)?
            .set_default("max_payload_bytes", 10 * 1024 * 1024)? // 10 MiB
            .set_default("storage_backend", "postgres")?
            .set_default("database_url", "")?
            .set_default("lock_wait_timeout_ms", 5000)?
            .set_default("default_list_limit", 100)?
            .set_default("max_list_limit", 1000)?
            .set_default("log_format", "text")?
            .add_source(config::Environment::default())
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_port == 0 {
            return Err(anyhow!("HTTP port must be greater than 0"));
        }

        if self.storage_backend == StorageBackend::Postgres && self.database_url.is_empty() {
            return Err(anyhow!("DATABASE_URL is required for the postgres backend"));
        }

        if self.max_payload_bytes == 0 {
            return Err(anyhow!("Max payload size must be greater than 0"));
        }

        if self.lock_wait_timeout_ms == 0 {
            return Err(anyhow!("Lock wait timeout must be greater than 0"));
        }

        if self.max_list_limit < 1 {
            return Err(anyhow!("Max list limit must be at least 1"));
        }

        if self.default_list_limit < 1 || self.default_list_limit > self.max_list_limit {
            return Err(anyhow!(
                "Default list limit must be between 1 and {}",
                self.max_list_limit
            ));
        }

        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}
