//! Error taxonomy for the ingest pipeline
//!
//! Failures are classified by how the pipeline reacts to them:
//! - **Decode / Validation**: the payload is bad, dead-letter without retrying
//! - **TransientPersist**: storage hiccup, retry with backoff until exhausted
//! - **PermanentPersist**: storage rejected the document, dead-letter immediately

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Terminal failure classification carried on every dead-lettered record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Decode,
    Validation,
    TransientPersist,
    PermanentPersist,
}

impl ErrorKind {
    /// Only transient persistence failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientPersist)
    }
}

/// Payload bytes could not be turned into the expected type
#[derive(Error, Debug)]
#[error("Decode error: {0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError(err.to_string())
    }
}

/// Persister failure, classified by whether retrying can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("Transient persist error: {0}")]
    Transient(String),

    #[error("Permanent persist error: {0}")]
    Permanent(String),
}

impl PersistError {
    pub fn transient(message: impl Into<String>) -> Self {
        PersistError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PersistError::Permanent(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistError::Transient(_) => ErrorKind::TransientPersist,
            PersistError::Permanent(_) => ErrorKind::PermanentPersist,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PersistError::Transient(m) | PersistError::Permanent(m) => m,
        }
    }
}

/// Error emitted by the Error Router after its local retry is spent
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Sink '{sink}' unavailable: {message}")]
    SinkUnavailable { sink: &'static str, message: String },
}

/// Inbound/outbound transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Consumer group was deleted underneath us (e.g. stream flushed)
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, TransportError::Redis(e) if e.to_string().contains("NOGROUP"))
    }

    pub fn is_connection_error(&self) -> bool {
        match self {
            TransportError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            TransportError::Closed => true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Redis(e) if e.is_timeout())
    }
}

/// Top-level error returned by the worker loop and startup helpers
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] core_config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] database::DatabaseError),
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::Transport(TransportError::Redis(err))
    }
}
