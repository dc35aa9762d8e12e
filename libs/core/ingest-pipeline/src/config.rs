//! Worker configuration

use core_config::{ConfigError, env_parse_or};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::registry::StreamDef;
use crate::router::RouteMode;

/// When the inbound message is acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CommitMode {
    /// Ack before handling. A crash mid-handle loses the message.
    Before,
    /// Ack once `handle` returns. A crash mid-handle replays it.
    #[default]
    After,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Unique per process
    pub consumer_id: String,
    pub dlq_stream: String,
    /// Approximate MAXLEN for the dead-letter stream
    pub max_length: i64,
    pub batch_size: usize,
    /// XREADGROUP BLOCK timeout; `None` polls
    pub block_timeout_ms: Option<u64>,
    pub max_concurrent_jobs: usize,
    pub claim_idle_ms: u64,
    pub commit_mode: CommitMode,
    pub route_mode: RouteMode,
    /// Upper bound on waiting for in-flight handlers at shutdown
    pub shutdown_timeout: Duration,
    /// Per-probe timeout for readiness checks
    pub health_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_stream_def<S: StreamDef>() -> Self {
        Self {
            stream_name: S::STREAM_NAME.to_string(),
            consumer_group: S::CONSUMER_GROUP.to_string(),
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            dlq_stream: S::DLQ_STREAM.to_string(),
            max_length: S::MAX_LENGTH,
            batch_size: S::BATCH_SIZE,
            block_timeout_ms: Some(5000),
            max_concurrent_jobs: 8,
            claim_idle_ms: S::CLAIM_IDLE_MS,
            commit_mode: CommitMode::default(),
            route_mode: RouteMode::default(),
            shutdown_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_millis(2000),
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_dlq_stream(mut self, stream: impl Into<String>) -> Self {
        self.dlq_stream = stream.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_block_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.block_timeout_ms = timeout;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_claim_idle_ms(mut self, idle: u64) -> Self {
        self.claim_idle_ms = idle;
        self
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_route_mode(mut self, mode: RouteMode) -> Self {
        self.route_mode = mode;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// How long one read may park on the server; `None` when reads poll
    pub fn block_timeout(&self) -> Option<Duration> {
        self.block_timeout_ms.map(Duration::from_millis)
    }

    /// Apply `INGEST_*` overrides on top of the stream definition:
    /// `INGEST_STREAM`, `INGEST_CONSUMER_GROUP`, `INGEST_CONSUMER_ID`,
    /// `INGEST_DLQ_STREAM`, `INGEST_BATCH_SIZE`, `INGEST_BLOCK_TIMEOUT_MS`
    /// (0 polls), `INGEST_CONCURRENCY`, `INGEST_COMMIT_MODE`,
    /// `INGEST_ROUTE_MODE`, `INGEST_CLAIM_IDLE_MS`,
    /// `INGEST_SHUTDOWN_TIMEOUT_SECS`, `INGEST_HEALTH_TIMEOUT_MS`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        let block_default = self.block_timeout_ms.unwrap_or(0);
        let block = env_parse_or("INGEST_BLOCK_TIMEOUT_MS", block_default)?;

        let config = Self {
            stream_name: env_parse_or("INGEST_STREAM", self.stream_name)?,
            consumer_group: env_parse_or("INGEST_CONSUMER_GROUP", self.consumer_group)?,
            consumer_id: env_parse_or("INGEST_CONSUMER_ID", self.consumer_id)?,
            dlq_stream: env_parse_or("INGEST_DLQ_STREAM", self.dlq_stream)?,
            max_length: self.max_length,
            batch_size: env_parse_or("INGEST_BATCH_SIZE", self.batch_size)?,
            block_timeout_ms: (block > 0).then_some(block),
            max_concurrent_jobs: env_parse_or("INGEST_CONCURRENCY", self.max_concurrent_jobs)?,
            claim_idle_ms: env_parse_or("INGEST_CLAIM_IDLE_MS", self.claim_idle_ms)?,
            commit_mode: env_parse_or("INGEST_COMMIT_MODE", self.commit_mode)?,
            route_mode: env_parse_or("INGEST_ROUTE_MODE", self.route_mode)?,
            shutdown_timeout: env_parse_or(
                "INGEST_SHUTDOWN_TIMEOUT_SECS",
                self.shutdown_timeout.as_secs(),
            )
            .map(Duration::from_secs)?,
            health_timeout: env_parse_or(
                "INGEST_HEALTH_TIMEOUT_MS",
                self.health_timeout.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("INGEST_BATCH_SIZE", "must be greater than 0"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::invalid("INGEST_CONCURRENCY", "must be greater than 0"));
        }
        if self.dlq_stream == self.stream_name {
            return Err(ConfigError::invalid(
                "INGEST_DLQ_STREAM",
                "must differ from the inbound stream",
            ));
        }
        Ok(())
    }
}
