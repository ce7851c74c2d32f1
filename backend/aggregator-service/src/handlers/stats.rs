use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub last_updated: DateTime<Utc>,
    pub topics: Vec<String>,
    pub uptime: String,
}

/// Aggregate counters plus live topic list.
///
/// GET /stats
pub async fn get_stats(state: web::Data<AppState>) -> Result<HttpResponse> {
    let counters = state
        .store()
        .counters()
        .await?
        .ok_or_else(|| AppError::NotInitialized("Stats not initialized".to_string()))?;

    let topics = state.store().distinct_topics().await?;

    Ok(HttpResponse::Ok().json(StatsResponse {
        received: counters.received,
        unique_processed: counters.unique_processed,
        duplicate_dropped: counters.duplicate_dropped,
        last_updated: counters.last_updated,
        topics,
        uptime: format_uptime(state.uptime()),
    }))
}

/// `H:MM:SS`, prefixed with `N day(s), ` past 24 hours.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let clock = format!("{hours}:{minutes:02}:{seconds:02}");
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}
