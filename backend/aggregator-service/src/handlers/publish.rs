use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde_json::Value;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Ingest one event (JSON object) or a batch (JSON array).
///
/// POST /publish
pub async fn publish(
    state: web::Data<AppState>,
    body: std::result::Result<web::Bytes, actix_web::Error>,
) -> Result<HttpResponse> {
    let body = body.map_err(payload_error)?;

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Invalid JSON body".to_string()))?;

    let records = match parsed {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => {
            return Err(AppError::BadRequest(
                "Request body must be a JSON object or array".to_string(),
            ))
        }
    };

    debug!(records = records.len(), "Received publish request");

    let summary = state.processor.process_batch(&records).await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// Body extraction failures (size limit, broken stream) as JSON errors.
fn payload_error(err: actix_web::Error) -> AppError {
    if err.as_response_error().status_code() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("Request body too large".to_string())
    } else {
        AppError::BadRequest(format!("Failed to read request body: {err}"))
    }
}
