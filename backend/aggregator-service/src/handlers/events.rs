use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use event_dedup::StoredEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub topic: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventView {
    pub event_id: String,
    pub topic: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl From<StoredEvent> for EventView {
    fn from(event: StoredEvent) -> Self {
        Self {
            event_id: event.event_id,
            topic: event.topic,
            source: event.source,
            timestamp: event.timestamp,
            payload: event.payload,
        }
    }
}

/// List stored events, newest first.
///
/// GET /events?topic=&limit=
pub async fn list_events(
    state: web::Data<AppState>,
    query: web::Query<ListEventsQuery>,
) -> Result<HttpResponse> {
    let ListEventsQuery { topic, limit } = query.into_inner();

    let limit = limit.unwrap_or(state.default_list_limit);
    if limit < 1 || limit > state.max_list_limit {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            state.max_list_limit
        )));
    }

    // An empty `topic=` means no filter
    let topic = topic.filter(|t| !t.is_empty());

    let events = state.store().list_events(topic.as_deref(), limit).await?;
    if topic.is_some() && events.is_empty() {
        return Err(AppError::NotFound("No events found".to_string()));
    }

    let body: Vec<EventView> = events.into_iter().map(EventView::from).collect();
    Ok(HttpResponse::Ok().json(body))
}
