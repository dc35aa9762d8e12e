//! Dependency health and the HTTP probe endpoints
//!
//! - `/health`, `/healthz`: liveness, always 200 while the process serves
//! - `/ready`, `/readyz`: every registered probe, 200 or 503
//! - `/metrics`: Prometheus text format

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use core_config::AppInfo;
use futures::future::join_all;
use mongodb::Client;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::metrics::prometheus_handle;

/// One dependency probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> Result<(), String>;
}

/// Redis `PING` over the given connection
pub struct RedisHealthCheck {
    name: String,
    conn: ConnectionManager,
}

impl RedisHealthCheck {
    pub fn new(name: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }
}

#[async_trait]
impl HealthCheck for RedisHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        let mut conn = self.conn.clone();
        database::redis::check_health(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }
}

/// MongoDB `ping`
pub struct MongoHealthCheck {
    name: String,
    client: Client,
}

impl MongoHealthCheck {
    pub fn new(client: Client) -> Self {
        Self {
            name: "mongo".to_string(),
            client,
        }
    }
}

#[async_trait]
impl HealthCheck for MongoHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        database::mongodb::check_health(&self.client)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub components: Vec<ComponentHealth>,
}

impl HealthStatus {
    pub fn up(&self) -> bool {
        self.components.iter().all(|c| c.up)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Runs every registered probe concurrently, each under its own timeout.
pub struct HealthAggregator {
    checks: Vec<Arc<dyn HealthCheck>>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            timeout,
        }
    }

    pub fn register(mut self, check: impl HealthCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    pub async fn check(&self) -> HealthStatus {
        let probes = self.checks.iter().map(|check| self.run(check.as_ref()));
        HealthStatus {
            components: join_all(probes).await,
        }
    }

    async fn run(&self, check: &dyn HealthCheck) -> ComponentHealth {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, check.probe()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let detail = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(format!("timed out after {}ms", self.timeout.as_millis())),
        };
        if let Some(detail) = &detail {
            warn!(component = %check.name(), detail = %detail, "Health probe failed");
        }

        ComponentHealth {
            name: check.name().to_string(),
            up: detail.is_none(),
            detail,
            latency_ms,
        }
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub app: AppInfo,
    pub aggregator: Arc<HealthAggregator>,
}

impl HealthState {
    pub fn new(app: AppInfo, aggregator: HealthAggregator) -> Self {
        Self {
            app,
            aggregator: Arc::new(aggregator),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    #[serde(flatten)]
    pub health: HealthStatus,
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app.name.to_string(),
        version: state.app.version.to_string(),
    })
}

pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<ReadyResponse>) {
    let health = state.aggregator.check().await;
    let (code, status) = if health.up() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(ReadyResponse {
            status: status.to_string(),
            health,
        }),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    let content_type = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
    match prometheus_handle() {
        Some(handle) => (StatusCode::OK, content_type, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            content_type,
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
