//! Stream definitions and entry field names

use strum::{AsRefStr, Display, EnumString};

/// Reserved field names in a stream entry. Every other field is a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EntryField {
    /// Raw payload bytes
    Payload,
    /// Optional producer key
    Key,
}

impl EntryField {
    pub fn is_reserved(name: &str) -> bool {
        name == EntryField::Payload.as_ref() || name == EntryField::Key.as_ref()
    }
}

/// Static description of an inbound stream, implemented per domain.
///
/// ```rust,ignore
/// pub struct UserStream;
///
/// impl StreamDef for UserStream {
///     const STREAM_NAME: &'static str = "users:ingest";
///     const CONSUMER_GROUP: &'static str = "users_consumer";
///     const DLQ_STREAM: &'static str = "users:dlq";
/// }
/// ```
pub trait StreamDef: Send + Sync {
    const STREAM_NAME: &'static str;
    const CONSUMER_GROUP: &'static str;
    /// Where failure records are republished
    const DLQ_STREAM: &'static str;

    /// Approximate MAXLEN applied when writing to the dead-letter stream
    const MAX_LENGTH: i64 = 100_000;

    const BATCH_SIZE: usize = 10;

    /// Pending entries idle longer than this are claimed from their consumer
    const CLAIM_IDLE_MS: u64 = 60_000;
}
