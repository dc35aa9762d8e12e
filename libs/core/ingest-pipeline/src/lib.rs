//! Ingest Pipeline
//!
//! Retry-aware consumption edge: messages come off a Redis stream, are
//! decoded, validated and upserted into MongoDB. Transient storage failures
//! are retried with exponential backoff up to a bound; anything terminal is
//! routed to a dead-letter sink with its full failure context.
//!
//! ## Features
//!
//! - **Generic handler**: `Handler<T, V, P, R>` composes a validator, a
//!   persister and an error router around any `Payload` type
//! - **Bounded retry**: `RetryTracker` with per-attempt or first-failure
//!   delay base; retries wait in an in-process timer queue, never on a worker
//! - **Dead letters**: republish to a DLQ stream, log, or both
//! - **Consumer groups**: pending replay on startup, claiming from dead consumers
//! - **Health endpoints**: liveness, aggregated readiness, Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use ingest_pipeline::*;
//!
//! let config = WorkerConfig::from_stream_def::<UserStream>().with_env_overrides()?;
//! let tracker = RetryTracker::new(RetryConfig::from_env()?.into_policy()?);
//! let metrics = PipelineMetrics::new(&config.stream_name);
//!
//! let (scheduler, ready) = RetryScheduler::spawn();
//! let router = DeadLetterRouter::for_mode(
//!     config.route_mode,
//!     RedisPublisher::from_config(writer, &config),
//!     metrics.clone(),
//! );
//! let handler = Handler::new(
//!     DeriveValidator::<User>::new(),
//!     MongoWriter::<User>::new(&db, "user"),
//!     router,
//!     tracker,
//!     scheduler.clone(),
//!     metrics,
//! );
//!
//! let source = RedisSource::new(reader, &config);
//! PipelineWorker::new(source, handler, scheduler, ready, config)
//!     .run(shutdown_rx)
//!     .await?;
//! ```

mod backoff;
mod config;
mod error;
mod handler;
pub mod health;
mod message;
pub mod metrics;
mod mongo;
mod payload;
mod persister;
mod redis_streams;
mod registry;
mod retry;
pub mod router;
mod scheduler;
mod transport;
mod validator;
mod worker;

pub use backoff::BackoffPolicy;
pub use config::{CommitMode, WorkerConfig};
pub use error::{DecodeError, ErrorKind, PersistError, PipelineError, RouteError, TransportError};
pub use handler::{Delivery, Handler, MessageHandler, Outcome, Stage};
pub use health::{
    ComponentHealth, HealthAggregator, HealthCheck, HealthState, HealthStatus, MongoHealthCheck,
    RedisHealthCheck, health_router,
};
pub use message::{Headers, Message};
pub use metrics::{PipelineMetrics, init_metrics};
pub use mongo::{MongoWriter, classify_error};
pub use payload::{Payload, decode};
pub use persister::{Ack, Persister};
pub use redis_streams::{RedisPublisher, RedisSource};
pub use registry::{EntryField, StreamDef};
pub use retry::{DelayBase, RetryConfig, RetryDecision, RetryPolicy, RetryState, RetryTracker};
pub use router::{
    DeadLetterRouter, ErrorRouter, ErrorSink, FailureRecord, LogSink, RepublishSink, RouteMode,
};
pub use scheduler::RetryScheduler;
pub use transport::{MessagePublisher, MessageSource};
pub use validator::{
    DeriveValidator, FieldError, FnValidator, ValidationResult, Validator,
};
pub use worker::PipelineWorker;
