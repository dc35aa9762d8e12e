use ingest_pipeline::StreamDef;

/// Inbound user events and their dead-letter stream
pub struct UserStream;

impl StreamDef for UserStream {
    const STREAM_NAME: &'static str = "users:ingest";
    const CONSUMER_GROUP: &'static str = "users_consumer";
    const DLQ_STREAM: &'static str = "users:dlq";
}
