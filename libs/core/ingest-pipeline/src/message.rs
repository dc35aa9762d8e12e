//! Transport-neutral message envelope
//!
//! A [`Message`] is what the transport hands the pipeline: an opaque payload
//! plus headers. It is never mutated after receipt; retries re-decode the
//! original bytes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// String headers carried alongside the payload
pub type Headers = HashMap<String, String>;

/// Inbound message as delivered by a [`crate::MessageSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Transport-assigned id (Redis entry id, e.g. "1700000000000-0")
    pub id: String,
    /// Stream the message was read from
    pub source: String,
    /// Optional partitioning/identity key set by the producer
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
    /// Producer time, parsed from the entry id when possible
    pub timestamp: DateTime<Utc>,
    /// How many times the transport has delivered this entry
    pub delivery_count: u32,
}

impl Message {
    pub fn new(id: impl Into<String>, source: impl Into<String>, payload: Vec<u8>) -> Self {
        let id = id.into();
        let timestamp = parse_timestamp(&id);
        Self {
            id,
            source: source.into(),
            key: None,
            headers: Headers::new(),
            payload,
            timestamp,
            delivery_count: 1,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

/// Parse the producer timestamp from a Redis stream id ("timestamp_ms-sequence").
/// Ids from other transports fall back to now.
pub fn parse_timestamp(id: &str) -> DateTime<Utc> {
    id.split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}
