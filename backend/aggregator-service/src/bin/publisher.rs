//! Synthetic load generator for the aggregator.
//!
//! Posts batches of random events to `/publish`, re-sending a share of each
//! batch so the deduplication path is exercised continuously.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

const TOPICS: [&str; 4] = ["sensor-temp", "sensor-humidity", "system-log", "user-activity"];
const SOURCES: [&str; 3] = ["raspberry-pi", "iot-hub", "mobile-app"];
const STATUSES: [&str; 3] = ["ok", "warn", "error"];

const CONNECT_BACKOFF: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
struct PublisherConfig {
    #[serde(default = "default_aggregator_url")]
    aggregator_url: String,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_duplication_rate")]
    duplication_rate: f64,
    /// Seconds between batches
    #[serde(default = "default_delay")]
    delay: f64,
}

fn default_aggregator_url() -> String {
    "http://localhost:8000/publish".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_duplication_rate() -> f64 {
    0.2
}

fn default_delay() -> f64 {
    1.0
}

impl PublisherConfig {
    fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env().context("Invalid publisher configuration")?;

        if config.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be greater than 0");
        }
        if !(0.0..=1.0).contains(&config.duplication_rate) {
            anyhow::bail!("DUPLICATION_RATE must be between 0 and 1");
        }
        if !config.delay.is_finite() || config.delay < 0.0 {
            anyhow::bail!("DELAY must be a non-negative number of seconds");
        }
        Ok(config)
    }

    fn duplicates_per_batch(&self) -> usize {
        let wanted = (self.batch_size as f64 * self.duplication_rate) as usize;
        wanted.min(self.batch_size)
    }
}

fn random_event<R: Rng>(rng: &mut R) -> Value {
    json!({
        "topic": TOPICS[rng.gen_range(0..TOPICS.len())],
        "event_id": uuid::Uuid::new_v4().to_string(),
        "timestamp": Utc::now().to_rfc3339(),
        "source": SOURCES[rng.gen_range(0..SOURCES.len())],
        "payload": {
            "value": rng.gen_range(0..=100),
            "status": STATUSES[rng.gen_range(0..STATUSES.len())],
        }
    })
}

/// Fresh events plus re-sent copies of some of them, shuffled.
fn build_batch<R: Rng>(config: &PublisherConfig, rng: &mut R) -> Vec<Value> {
    let mut batch: Vec<Value> = (0..config.batch_size).map(|_| random_event(rng)).collect();

    let duplicates: Vec<Value> = batch
        .choose_multiple(rng, config.duplicates_per_batch())
        .cloned()
        .collect();
    batch.extend(duplicates);
    batch.shuffle(rng);
    batch
}

async fn send_batch(client: &reqwest::Client, url: &str, batch: &[Value]) -> reqwest::Result<Value> {
    client
        .post(url)
        .json(batch)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "publisher=info".into()),
        )
        .init();

    let config = PublisherConfig::from_env()?;
    info!(
        url = %config.aggregator_url,
        batch_size = config.batch_size,
        duplication_rate = config.duplication_rate,
        "Starting publisher"
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;
    let delay = Duration::from_secs_f64(config.delay);

    loop {
        let batch = build_batch(&config, &mut rand::thread_rng());

        let pause = match send_batch(&client, &config.aggregator_url, &batch).await {
            Ok(summary) => {
                info!(sent = batch.len(), response = %summary, "Batch published");
                delay
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(error = %e, "Aggregator unreachable, retrying");
                CONNECT_BACKOFF
            }
            Err(e) => {
                error!(error = %e, "Publish failed");
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}
