use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// GET /
pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Aggregator Service is Running",
        "docs": "/health"
    }))
}

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "aggregator-service"
    }))
}

/// Readiness: one round trip to the store.
///
/// GET /ready
pub async fn ready(state: web::Data<AppState>) -> HttpResponse {
    match state.store().counters().await {
        Ok(_) => HttpResponse::Ok().json(json!({"status": "ready"})),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            HttpResponse::ServiceUnavailable().json(json!({"status": "not_ready"}))
        }
    }
}
