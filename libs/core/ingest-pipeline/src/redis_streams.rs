//! Redis Streams transport
//!
//! [`RedisSource`] reads through a consumer group and [`RedisPublisher`]
//! appends with `XADD MAXLEN ~`. Entries carry the raw bytes in a `payload`
//! field and an optional `key` field; every other field is a header.

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::TransportError;
use crate::message::{Headers, Message};
use crate::registry::EntryField;
use crate::transport::{MessagePublisher, MessageSource};

type Fields = Vec<(String, Vec<u8>)>;
/// Deleted entries come back from a pending read with nil fields
type Entry = (String, Option<Fields>);
type StreamReply = Vec<(String, Vec<Entry>)>;

/// Consumer-group reader over one stream
pub struct RedisSource {
    /// Carries the blocking XREADGROUP
    conn: ConnectionManager,
    /// Everything else, so a blocked read never delays an ack
    control: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block_ms: Option<u64>,
    claim_idle_ms: u64,
    /// Set once this consumer's own pending list has been replayed
    pending_drained: AtomicBool,
    /// Last pending id replayed; each replay pass walks the list once
    pending_cursor: Mutex<String>,
}

impl RedisSource {
    pub fn new(conn: ConnectionManager, config: &WorkerConfig) -> Self {
        Self {
            control: conn.clone(),
            conn,
            stream: config.stream_name.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_id.clone(),
            block_ms: config.block_timeout_ms,
            claim_idle_ms: config.claim_idle_ms,
            pending_drained: AtomicBool::new(false),
            pending_cursor: Mutex::new("0".to_string()),
        }
    }

    /// Route acks, claims and health pings over a second connection.
    pub fn with_control_connection(mut self, control: ConnectionManager) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> ConnectionManager {
        self.control.clone()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Entries delivered to this consumer but never acknowledged, e.g. from
    /// before a restart.
    async fn read_pending(&self, count: usize) -> Result<Vec<Message>, TransportError> {
        let mut conn = self.control.clone();
        let cursor = self.cursor().clone();
        let reply: StreamReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(&cursor)
            .query_async(&mut conn)
            .await?;

        let last_id = reply
            .iter()
            .filter_map(|(_, entries)| entries.last())
            .map(|(id, _)| id.clone())
            .last();
        match last_id {
            Some(id) => *self.cursor() = id,
            None => {
                *self.cursor() = "0".to_string();
                self.pending_drained.store(true, Ordering::Release);
            }
        }

        let messages = self.parse_reply(reply, 2).await;
        if !messages.is_empty() {
            info!(stream = %self.stream, count = messages.len(), "Replaying pending entries");
        }
        Ok(messages)
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, String> {
        self.pending_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Walk this consumer's pending list again from the start.
    fn restart_replay(&self) {
        *self.cursor() = "0".to_string();
        self.pending_drained.store(false, Ordering::Release);
    }

    async fn read_new(&self, count: usize) -> Result<Vec<Message>, TransportError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer);

        if let Some(timeout) = self.block_ms {
            cmd.arg("BLOCK").arg(timeout);
        }

        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">");

        let reply: Option<StreamReply> = cmd.query_async(&mut conn).await?;
        match reply {
            Some(reply) => Ok(self.parse_reply(reply, 1).await),
            None => Ok(vec![]),
        }
    }

    async fn parse_reply(&self, reply: StreamReply, delivery_count: u32) -> Vec<Message> {
        let mut messages = Vec::new();
        for (_stream, entries) in reply {
            for (id, fields) in entries {
                match fields {
                    Some(fields) => {
                        messages.push(self.to_message(id, fields, delivery_count));
                    }
                    None => self.discard_deleted(&id).await,
                }
            }
        }
        messages
    }

    /// Build a message from raw fields. A missing payload field becomes an
    /// empty payload, which the handler dead-letters as a decode failure.
    fn to_message(&self, id: String, fields: Fields, delivery_count: u32) -> Message {
        let mut payload = Vec::new();
        let mut key = None;
        let mut headers = Headers::new();

        for (name, value) in fields {
            match name.parse::<EntryField>() {
                Ok(EntryField::Payload) => payload = value,
                Ok(EntryField::Key) => key = Some(String::from_utf8_lossy(&value).into_owned()),
                Err(_) => {
                    headers.insert(name, String::from_utf8_lossy(&value).into_owned());
                }
            }
        }

        if payload.is_empty() {
            warn!(stream = %self.stream, id = %id, "Entry has no payload field");
        }

        let mut message = Message::new(id, self.stream.clone(), payload)
            .with_headers(headers)
            .with_delivery_count(delivery_count);
        message.key = key;
        message
    }

    /// The entry was trimmed while pending; nothing is left to process.
    async fn discard_deleted(&self, id: &str) {
        warn!(stream = %self.stream, id = %id, "Pending entry was deleted, acknowledging");
        if let Err(e) = self.ack(id).await {
            warn!(error = %e, id = %id, "Failed to acknowledge deleted entry");
        }
    }
}

#[async_trait]
impl MessageSource for RedisSource {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn prepare(&self) -> Result<(), TransportError> {
        let mut conn = self.control.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!(stream = %self.stream, group = %self.group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.restart_replay();
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Message>, TransportError> {
        if !self.pending_drained.load(Ordering::Acquire) {
            let pending = self.read_pending(max).await?;
            if !pending.is_empty() {
                return Ok(pending);
            }
        }

        match self.read_new(max).await {
            Err(e) if e.is_timeout() => {
                // The server may still have delivered the batch into our
                // pending list; pick it up on the next call.
                self.restart_replay();
                Err(e)
            }
            other => other,
        }
    }

    async fn ack(&self, id: &str) -> Result<(), TransportError> {
        let mut conn = self.control.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %self.stream, id = %id, "Acknowledged entry");
        Ok(())
    }

    async fn reclaim(&self, max: usize) -> Result<Vec<Message>, TransportError> {
        let mut conn = self.control.clone();

        // (id, consumer, idle_ms, delivery_count)
        let pending: Vec<(String, String, u64, u32)> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let candidates: Vec<(String, u32)> = pending
            .into_iter()
            .filter(|(_, owner, _, _)| owner != &self.consumer)
            .map(|(id, _, _, count)| (id, count))
            .collect();

        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle_ms);
        for (id, _) in &candidates {
            cmd.arg(id);
        }

        let claimed: Vec<Entry> = cmd.query_async(&mut conn).await?;
        let mut messages = Vec::with_capacity(claimed.len());
        for (id, fields) in claimed {
            let Some(fields) = fields else {
                self.discard_deleted(&id).await;
                continue;
            };
            let count = candidates
                .iter()
                .find(|(candidate, _)| candidate == &id)
                .map(|(_, count)| count + 1)
                .unwrap_or(2);
            messages.push(self.to_message(id, fields, count));
        }

        if !messages.is_empty() {
            warn!(stream = %self.stream, count = messages.len(), "Claimed abandoned entries");
        }
        Ok(messages)
    }
}

/// `XADD` writer, used for the dead-letter stream
pub struct RedisPublisher {
    conn: ConnectionManager,
    stream: String,
    max_length: i64,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
            max_length: 100_000,
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn from_config(conn: ConnectionManager, config: &WorkerConfig) -> Self {
        Self::new(conn, config.dlq_stream.clone()).with_max_length(config.max_length)
    }
}

#[async_trait]
impl MessagePublisher for RedisPublisher {
    fn destination(&self) -> &str {
        &self.stream
    }

    async fn publish(
        &self,
        payload: &[u8],
        headers: &Headers,
        key: Option<&str>,
    ) -> Result<String, TransportError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(EntryField::Payload.as_ref())
            .arg(payload);

        if let Some(key) = key {
            cmd.arg(EntryField::Key.as_ref()).arg(key);
        }

        let mut names: Vec<&String> = headers.keys().collect();
        names.sort();
        for name in names {
            if EntryField::is_reserved(name) {
                continue;
            }
            cmd.arg(name).arg(&headers[name]);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream = %self.stream, id = %id, "Published entry");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamDef;
    use std::time::Duration;
    use test_utils::TestRedis;

    struct Probe;

    impl StreamDef for Probe {
        const STREAM_NAME: &'static str = "probe:ingest";
        const CONSUMER_GROUP: &'static str = "probe_consumer";
        const DLQ_STREAM: &'static str = "probe:dlq";
    }

    fn config() -> WorkerConfig {
        WorkerConfig::from_stream_def::<Probe>()
            .with_consumer_id("probe-1")
            .with_block_timeout_ms(Some(100))
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_publish_receive_ack() {
        let redis = TestRedis::new().await;
        let conn = redis.connection_manager().await;
        let config = config();

        let source = RedisSource::new(conn.clone(), &config);
        source.prepare().await.unwrap();
        // Second prepare hits BUSYGROUP and is fine
        source.prepare().await.unwrap();

        let publisher = RedisPublisher::new(conn, &config.stream_name);
        let headers = Headers::from([("trace-id".to_string(), "t-1".to_string())]);
        publisher
            .publish(br#"{"id":"u1"}"#, &headers, Some("u1"))
            .await
            .unwrap();

        let batch = source.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        let message = &batch[0];
        assert_eq!(message.payload, br#"{"id":"u1"}"#);
        assert_eq!(message.key.as_deref(), Some("u1"));
        assert_eq!(message.headers.get("trace-id").map(String::as_str), Some("t-1"));
        assert!(!message.is_redelivery());

        source.ack(&message.id).await.unwrap();
        assert!(source.receive(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_unacked_entries_replay_after_restart() {
        let redis = TestRedis::new().await;
        let conn = redis.connection_manager().await;
        let config = config();

        let first = RedisSource::new(conn.clone(), &config);
        first.prepare().await.unwrap();
        RedisPublisher::new(conn.clone(), &config.stream_name)
            .publish(b"{}", &Headers::new(), None)
            .await
            .unwrap();
        assert_eq!(first.receive(10).await.unwrap().len(), 1);

        let restarted = RedisSource::new(conn, &config);
        restarted.prepare().await.unwrap();
        let replay = restarted.receive(10).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert!(replay[0].is_redelivery());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_reclaim_from_idle_consumer() {
        let redis = TestRedis::new().await;
        let conn = redis.connection_manager().await;

        let crashed = RedisSource::new(conn.clone(), &config().with_consumer_id("crashed"));
        crashed.prepare().await.unwrap();
        RedisPublisher::new(conn.clone(), Probe::STREAM_NAME)
            .publish(b"{}", &Headers::new(), None)
            .await
            .unwrap();
        assert_eq!(crashed.receive(10).await.unwrap().len(), 1);

        let peer = RedisSource::new(conn, &config().with_consumer_id("peer").with_claim_idle_ms(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let claimed = peer.reclaim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_idle_blocking_read_outlasting_default_timeout_is_empty() {
        let redis = TestRedis::new().await;
        let config = config().with_block_timeout_ms(Some(1_500));
        let block = config.block_timeout().unwrap();
        let reader = database::redis::connect_with_config(
            redis.connection_string(),
            database::redis::blocking_read_config(block, Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let source = RedisSource::new(reader, &config)
            .with_control_connection(redis.connection_manager().await);
        source.prepare().await.unwrap();

        // Empty pending list, then one idle block on new entries
        assert!(source.receive(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_replay_pages_through_pending_then_reads_new() {
        let redis = TestRedis::new().await;
        let conn = redis.connection_manager().await;
        let config = config();
        let publisher = RedisPublisher::new(conn.clone(), &config.stream_name);

        let first = RedisSource::new(conn.clone(), &config);
        first.prepare().await.unwrap();
        for body in [r#"{"n":1}"#, r#"{"n":2}"#] {
            publisher.publish(body.as_bytes(), &Headers::new(), None).await.unwrap();
        }
        assert_eq!(first.receive(10).await.unwrap().len(), 2);

        let restarted = RedisSource::new(conn, &config);
        restarted.prepare().await.unwrap();
        publisher.publish(br#"{"n":3}"#, &Headers::new(), None).await.unwrap();

        let one = restarted.receive(1).await.unwrap();
        let two = restarted.receive(1).await.unwrap();
        assert_eq!(one[0].payload, br#"{"n":1}"#);
        assert_eq!(two[0].payload, br#"{"n":2}"#);
        assert!(one[0].is_redelivery() && two[0].is_redelivery());

        // Neither was acked, but the pass is over and new entries come next
        let fresh = restarted.receive(10).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].payload, br#"{"n":3}"#);
        assert!(!fresh[0].is_redelivery());
    }
}
