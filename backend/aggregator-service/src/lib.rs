//! HTTP surface of the event aggregator.
//!
//! Thin actix-web layer over [`event_dedup::BatchProcessor`]: request
//! parsing, error mapping and the read-only listing and stats endpoints.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod state;

pub use config::{Config, LogFormat, StorageBackend};
pub use error::{AppError, Result};
pub use state::AppState;

use actix_web::web;

/// Register every route on an actix app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(format!("Invalid query string: {err}")).into()
    }))
    .route("/", web::get().to(handlers::root))
    .route("/health", web::get().to(handlers::health))
    .route("/ready", web::get().to(handlers::ready))
    .route("/metrics", web::get().to(metrics::serve_metrics))
    .route("/publish", web::post().to(handlers::publish))
    .route("/events", web::get().to(handlers::list_events))
    .route("/stats", web::get().to(handlers::get_stats));
}
