//! Publish body parsing and event validation
//!
//! Malformed input is rejected here and never reaches the queue.

use crate::pipeline::Event;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid body payload: {0}")]
    MalformedBody(String),

    #[error("Invalid event (event index {index}): {reason}")]
    InvalidEvent { index: usize, reason: String },

    #[error("Missing or empty field '{field}' (event index {index})")]
    EmptyField { index: usize, field: &'static str },

    #[error("Invalid timestamp format for event {event_id}: '{value}'")]
    InvalidTimestamp { event_id: String, value: String },

    #[error("Payload for event {event_id} must be a JSON object")]
    PayloadNotObject { event_id: String },

    #[error("Batch contains no events")]
    EmptyBatch,
}

/// Event fields as a producer sends them, before validation
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// Parse and validate a publish body: one event object or
/// `{"events": [...]}`. The whole body is rejected on the first invalid
/// event.
pub fn parse_publish(body: &str) -> Result<Vec<Event>, ValidationError> {
    let parsed: Value =
        serde_json::from_str(body).map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

    let items = match parsed {
        Value::Object(mut fields) if fields.contains_key("events") => {
            match fields.remove("events") {
                Some(Value::Array(items)) if items.is_empty() => {
                    return Err(ValidationError::EmptyBatch)
                }
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ValidationError::MalformedBody(
                        "'events' must be an array".to_string(),
                    ))
                }
            }
        }
        single @ Value::Object(_) => vec![single],
        _ => {
            return Err(ValidationError::MalformedBody(
                "expected an event object or {\"events\": [...]}".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let raw: RawEvent = serde_json::from_value(item).map_err(|e| {
                ValidationError::InvalidEvent {
                    index,
                    reason: e.to_string(),
                }
            })?;
            validate(index, raw)
        })
        .collect()
}

fn validate(index: usize, raw: RawEvent) -> Result<Event, ValidationError> {
    for (field, value) in [
        ("topic", &raw.topic),
        ("event_id", &raw.event_id),
        ("timestamp", &raw.timestamp),
        ("source", &raw.source),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyField { index, field });
        }
    }

    // RFC 3339 requires an offset, so naive timestamps are rejected too
    let timestamp = DateTime::parse_from_rfc3339(raw.timestamp.trim()).map_err(|_| {
        ValidationError::InvalidTimestamp {
            event_id: raw.event_id.clone(),
            value: raw.timestamp.clone(),
        }
    })?;

    let payload = match raw.payload {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value @ Value::Object(_)) => value,
        Some(_) => {
            return Err(ValidationError::PayloadNotObject {
                event_id: raw.event_id,
            })
        }
    };

    Ok(Event {
        topic: raw.topic,
        event_id: raw.event_id,
        timestamp,
        source: raw.source,
        payload,
    })
}
