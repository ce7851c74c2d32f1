//! Event schema validation.
//!
//! Turns one raw JSON record into an [`Event`] or a [`ValidationError`].
//! Rules run in a fixed order: object shape, `event_id`, `topic`,
//! `timestamp`, `source`, then `payload` defaulting.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::Event;

/// Column width of the key and source columns
pub const MAX_FIELD_LEN: usize = 255;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Why a raw record was rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' must be a string")]
    NotAString(&'static str),

    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("field '{field}' exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Validate and normalize one raw record.
pub fn validate_event(raw: &Value) -> Result<Event, ValidationError> {
    let fields = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let event_id = non_empty_string(fields, "event_id")?;
    let topic = non_empty_string(fields, "topic")?;

    let raw_timestamp = required_string(fields, "timestamp")?;
    let timestamp = parse_timestamp(raw_timestamp)
        .ok_or_else(|| ValidationError::InvalidTimestamp(raw_timestamp.to_string()))?;

    let source = required_string(fields, "source")?;
    check_len("source", source)?;

    let payload = match fields.get("payload") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value.clone(),
    };

    Ok(Event {
        topic: topic.to_string(),
        event_id: event_id.to_string(),
        source: source.to_string(),
        timestamp,
        payload,
    })
}

/// Parse an ISO-8601-like timestamp.
///
/// RFC 3339 with an offset is preferred; a naive date-time (`T` or space
/// separator, optional fractional seconds) is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn required_string<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, ValidationError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(name)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ValidationError::NotAString(name)),
    }
}

fn non_empty_string<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, ValidationError> {
    let value = required_string(fields, name)?;
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(name));
    }
    check_len(name, value)?;
    Ok(value)
}

fn check_len(name: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(ValidationError::TooLong {
            field: name,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}
