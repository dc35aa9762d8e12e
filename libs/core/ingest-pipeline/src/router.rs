//! Error Router
//!
//! Every terminal failure becomes exactly one [`FailureRecord`] which is
//! handed to one or more sinks:
//! - **republish**: original payload + headers onto the dead-letter stream,
//!   with `x-*` failure headers added
//! - **log**: one structured `error!` event carrying the whole record
//!
//! Each sink gets one local retry after a short pause. A second failure is
//! logged with the full record and the record is dropped; the consumer keeps
//! going.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::{error, warn};

use crate::error::{ErrorKind, RouteError};
use crate::message::{Headers, Message};
use crate::metrics::PipelineMetrics;
use crate::transport::MessagePublisher;

/// Header names added to republished failures
pub mod headers {
    pub const ERROR_KIND: &str = "x-error-kind";
    pub const ERROR_MESSAGE: &str = "x-error-message";
    pub const RETRY_ATTEMPTS: &str = "x-retry-attempts";
    pub const FAILED_AT: &str = "x-failed-at";
    pub const SOURCE_STREAM: &str = "x-source-stream";
    pub const SOURCE_ID: &str = "x-source-id";
}

/// Immutable description of a message the pipeline gave up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message_id: String,
    pub source: String,
    pub key: Option<String>,
    #[serde(with = "lossy_bytes")]
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub kind: ErrorKind,
    pub error_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        message: Message,
        kind: ErrorKind,
        error_message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            message_id: message.id,
            source: message.source,
            key: message.key,
            payload: message.payload,
            headers: message.headers,
            kind,
            error_message: error_message.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Original headers plus the `x-*` failure headers. Failure headers win
    /// over same-named originals.
    pub fn failure_headers(&self) -> Headers {
        let mut out = self.headers.clone();
        out.insert(headers::ERROR_KIND.into(), self.kind.to_string());
        out.insert(headers::ERROR_MESSAGE.into(), self.error_message.clone());
        out.insert(headers::RETRY_ATTEMPTS.into(), self.attempts.to_string());
        out.insert(
            headers::FAILED_AT.into(),
            self.failed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        out.insert(headers::SOURCE_STREAM.into(), self.source.clone());
        out.insert(headers::SOURCE_ID.into(), self.message_id.clone());
        out
    }

    /// Payload as text for logs; invalid UTF-8 is replaced, not dropped
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

mod lossy_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

/// Which sinks receive failure records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RouteMode {
    #[default]
    Republish,
    Log,
    Both,
}

/// One destination for failure records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, record: &FailureRecord) -> Result<(), RouteError>;
}

/// Terminal-failure entry point used by the handler
#[async_trait]
pub trait ErrorRouter: Send + Sync {
    async fn route(&self, record: FailureRecord) -> Result<(), RouteError>;
}

#[async_trait]
impl<R: ErrorRouter + ?Sized> ErrorRouter for Arc<R> {
    async fn route(&self, record: FailureRecord) -> Result<(), RouteError> {
        (**self).route(record).await
    }
}

/// Emits the record as a single structured error event
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl ErrorSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, record: &FailureRecord) -> Result<(), RouteError> {
        error!(
            message_id = %record.message_id,
            source = %record.source,
            key = ?record.key,
            error_kind = %record.kind,
            error = %record.error_message,
            attempts = record.attempts,
            failed_at = %record.failed_at,
            headers = ?record.headers,
            payload = %record.payload_text(),
            "Message dead-lettered"
        );
        Ok(())
    }
}

/// Writes the original payload and headers plus failure headers to a
/// dead-letter destination on the transport
pub struct RepublishSink<P> {
    publisher: P,
}

impl<P: MessagePublisher> RepublishSink<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl<P: MessagePublisher> ErrorSink for RepublishSink<P> {
    fn name(&self) -> &'static str {
        "republish"
    }

    async fn publish(&self, record: &FailureRecord) -> Result<(), RouteError> {
        self.publisher
            .publish(
                &record.payload,
                &record.failure_headers(),
                record.key.as_deref(),
            )
            .await
            .map(|_| ())
            .map_err(|e| RouteError::SinkUnavailable {
                sink: self.name(),
                message: e.to_string(),
            })
    }
}

/// Fans a record out to its sinks with one local retry per sink
pub struct DeadLetterRouter {
    sinks: Vec<Arc<dyn ErrorSink>>,
    retry_pause: Duration,
    metrics: PipelineMetrics,
}

impl DeadLetterRouter {
    pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(200);

    pub fn new(sinks: Vec<Arc<dyn ErrorSink>>, metrics: PipelineMetrics) -> Self {
        Self {
            sinks,
            retry_pause: Self::DEFAULT_RETRY_PAUSE,
            metrics,
        }
    }

    /// Build the sink set for `mode`. `publisher` is only used when the mode
    /// republishes.
    pub fn for_mode<P>(mode: RouteMode, publisher: P, metrics: PipelineMetrics) -> Self
    where
        P: MessagePublisher + 'static,
    {
        let sinks: Vec<Arc<dyn ErrorSink>> = match mode {
            RouteMode::Republish => vec![Arc::new(RepublishSink::new(publisher))],
            RouteMode::Log => vec![Arc::new(LogSink)],
            RouteMode::Both => vec![Arc::new(RepublishSink::new(publisher)), Arc::new(LogSink)],
        };
        Self::new(sinks, metrics)
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    async fn publish_with_retry(
        &self,
        sink: &dyn ErrorSink,
        record: &FailureRecord,
    ) -> Result<(), RouteError> {
        let Err(first) = sink.publish(record).await else {
            return Ok(());
        };

        self.metrics.route_failed(sink.name());
        warn!(
            sink = sink.name(),
            message_id = %record.message_id,
            error = %first,
            "Error sink failed, retrying once"
        );
        tokio::time::sleep(self.retry_pause).await;

        match sink.publish(record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.route_failed(sink.name());
                self.metrics.dropped(sink.name());
                error!(
                    sink = sink.name(),
                    message_id = %record.message_id,
                    source = %record.source,
                    key = ?record.key,
                    error_kind = %record.kind,
                    error_message = %record.error_message,
                    attempts = record.attempts,
                    failed_at = %record.failed_at,
                    headers = ?record.headers,
                    payload = %record.payload_text(),
                    route_error = %e,
                    "Failure record dropped: error sink failed twice"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ErrorRouter for DeadLetterRouter {
    /// Every sink is attempted even if an earlier one failed; the first sink
    /// error is returned.
    async fn route(&self, record: FailureRecord) -> Result<(), RouteError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = self.publish_with_retry(sink.as_ref(), &record).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
