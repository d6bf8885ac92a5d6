//! Wire framing for log records.
//!
//! The record value is `{"event", "data", "timestamp"}` as JSON. The event
//! name and optional priority are duplicated into a string-keyed header map
//! so consumers can route without parsing the value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::event_bus::BusMessage;

pub const HEADER_EVENT: &str = "event";
pub const HEADER_PRIORITY: &str = "priority";

/// JSON body of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

/// A record ready to append: encoded value and headers.
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub key: Option<String>,
    pub headers: String,
    pub value: String,
}

pub fn encode(
    event: &str,
    data: serde_json::Value,
    timestamp: i64,
    key: Option<&str>,
    priority: Option<i32>,
) -> Result<EncodedRecord, BusError> {
    let mut headers = BTreeMap::new();
    headers.insert(HEADER_EVENT.to_string(), event.to_string());
    if let Some(p) = priority {
        headers.insert(HEADER_PRIORITY.to_string(), p.to_string());
    }

    let envelope = Envelope {
        event: event.to_string(),
        data,
        timestamp,
    };

    Ok(EncodedRecord {
        key: key.map(str::to_string),
        headers: serde_json::to_string(&headers)?,
        value: serde_json::to_string(&envelope)?,
    })
}

/// Rebuild a [`BusMessage`] from stored columns.
///
/// A header map that fails to parse is treated as empty; the value must
/// parse.
pub fn decode(
    topic: &str,
    partition: u32,
    offset: i64,
    key: Option<String>,
    headers: &str,
    value: &str,
) -> Result<BusMessage, BusError> {
    let envelope: Envelope = serde_json::from_str(value)?;
    let headers: BTreeMap<String, String> = serde_json::from_str(headers).unwrap_or_default();
    let priority = headers
        .get(HEADER_PRIORITY)
        .and_then(|p| p.parse::<i32>().ok());

    Ok(BusMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key,
        event: envelope.event,
        data: envelope.data,
        timestamp: envelope.timestamp,
        priority,
    })
}
