//! Users Consumer Service
//!
//! Reads user events from a Redis stream, validates them and upserts them
//! into MongoDB. Transient storage failures are retried with backoff; invalid
//! or exhausted messages go to the dead-letter stream.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (users:ingest)
//!   ↓ (Consumer Group: users_consumer)
//! PipelineWorker<RedisSource, Handler<User, ..>>
//!   ↓ validate → upsert
//! MongoDB (user collection)
//!
//! on failure:
//!   transient → timer queue → retry
//!   terminal  → Redis Stream (users:dlq) and/or error log
//! ```

use axum::Router;
use core_config::{AppInfo, ConfigError, Environment, FromEnv, ServerConfig, app_info, env_or_default};
use database::ConnectRetry;
use database::mongodb::{MongoConfig, connect_from_config_with_retry};
use database::redis::{
    ConnectionManagerConfig, RedisConfig, blocking_read_config, connect_with_config_and_retry,
    connect_with_retry,
};
use domain_users::{User, UserStream};
use eyre::{Result, WrapErr};
use ingest_pipeline::{
    DeadLetterRouter, DeriveValidator, Handler, HealthAggregator, HealthState, MongoHealthCheck,
    MongoWriter, PipelineMetrics, PipelineWorker, RedisHealthCheck, RedisPublisher, RedisSource,
    RetryConfig, RetryPolicy, RetryScheduler, RetryTracker, WorkerConfig, health_router,
    init_metrics,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Client-side slack on top of the server-side `XREADGROUP BLOCK`
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Everything the service reads from the environment, loaded once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub mongo: MongoConfig,
    pub reader: RedisConfig,
    pub writer: RedisConfig,
    pub retry: RetryPolicy,
    pub worker: WorkerConfig,
    /// `USERS_COLLECTION`
    pub collection: String,
}

impl FromEnv for AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let reader = RedisConfig::from_env()?;
        Ok(Self {
            server: ServerConfig::from_env()?,
            mongo: MongoConfig::from_env()?,
            writer: RedisConfig::writer_from_env(&reader),
            reader,
            retry: RetryConfig::from_env()?.into_policy()?,
            worker: WorkerConfig::from_stream_def::<UserStream>().with_env_overrides()?,
            collection: env_or_default("USERS_COLLECTION", "user"),
        })
    }
}

/// Serve `/health`, `/ready`, `/metrics` until the process exits
async fn start_health_server(state: HealthState, address: String) -> Result<()> {
    let app: Router = health_router(state);

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", address))?;

    info!(address = %address, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the consumer
///
/// 1. Sets up error reports, structured logging and metrics
/// 2. Loads and validates configuration (bad retry settings stop startup)
/// 3. Connects to MongoDB and both Redis endpoints with retry
/// 4. Runs the worker until SIGINT/SIGTERM, then drains
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics();

    let app_info: AppInfo = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting users consumer");
    info!("Environment: {:?}", environment);

    let config = AppConfig::from_env().wrap_err("Failed to load configuration")?;
    info!(
        stream = %config.worker.stream_name,
        consumer_group = %config.worker.consumer_group,
        consumer_id = %config.worker.consumer_id,
        dlq_stream = %config.worker.dlq_stream,
        route_mode = %config.worker.route_mode,
        commit_mode = %config.worker.commit_mode,
        max_retries = config.retry.max_retries,
        delay_base = %config.retry.delay_base,
        collection = %config.collection,
        "Configuration loaded"
    );

    let mongo = connect_from_config_with_retry(&config.mongo, ConnectRetry::default())
        .await
        .wrap_err("Failed to connect to MongoDB")?;
    let db = mongo.database(&config.mongo.database);

    // Blocking reads hold their connection, so the reader side gets two.
    let reader_config = match config.worker.block_timeout() {
        Some(block) => blocking_read_config(block, READ_TIMEOUT_MARGIN),
        None => ConnectionManagerConfig::new(),
    };
    let reader =
        connect_with_config_and_retry(&config.reader.url, reader_config, ConnectRetry::default())
            .await
            .wrap_err("Failed to connect to Redis reader")?;
    let control = connect_with_retry(&config.reader.url, ConnectRetry::default())
        .await
        .wrap_err("Failed to connect to Redis control connection")?;
    let writer = connect_with_retry(&config.writer.url, ConnectRetry::default())
        .await
        .wrap_err("Failed to connect to Redis writer")?;

    let metrics = PipelineMetrics::new(&config.worker.stream_name);
    let (scheduler, ready) = RetryScheduler::spawn();

    let router = DeadLetterRouter::for_mode(
        config.worker.route_mode,
        RedisPublisher::from_config(writer.clone(), &config.worker),
        metrics.clone(),
    );
    info!(sinks = ?router.sink_names(), "Error router ready");

    let handler = Handler::<User, _, _, _>::new(
        DeriveValidator::<User>::new(),
        MongoWriter::<User>::new(&db, &config.collection),
        router,
        RetryTracker::new(config.retry),
        scheduler.clone(),
        metrics,
    );

    let source =
        RedisSource::new(reader, &config.worker).with_control_connection(control.clone());

    let aggregator = HealthAggregator::new(config.worker.health_timeout)
        .register(MongoHealthCheck::new(mongo.clone()))
        .register(RedisHealthCheck::new("redis_reader", control))
        .register(RedisHealthCheck::new("redis_writer", writer));
    let health_state = HealthState::new(app_info, aggregator);

    let address = config.server.address();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, address).await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    PipelineWorker::new(source, handler, scheduler, ready, config.worker)
        .run(shutdown_rx)
        .await
        .wrap_err("Worker failed")?;

    info!("Users consumer stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
