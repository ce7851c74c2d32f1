use event_dedup::{BatchProcessor, EventStore};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;

/// Shared handler state, cloned into every actix worker.
#[derive(Clone)]
pub struct AppState {
    pub processor: BatchProcessor,
    pub started_at: Instant,
    pub default_list_limit: i64,
    pub max_list_limit: i64,
}

impl AppState {
    pub fn new(processor: BatchProcessor, config: &Config) -> Self {
        Self::with_limits(processor, config.default_list_limit, config.max_list_limit)
    }

    pub fn with_limits(processor: BatchProcessor, default_list_limit: i64, max_list_limit: i64) -> Self {
        Self {
            processor,
            started_at: Instant::now(),
            default_list_limit,
            max_list_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        self.processor.store()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
