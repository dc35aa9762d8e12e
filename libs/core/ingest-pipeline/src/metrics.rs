//! Prometheus metrics for the ingest pipeline

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ErrorKind;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Later calls are no-ops; if another
/// recorder is already installed the failure is logged and `/metrics`
/// reports unavailable.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Metrics emitted by one pipeline, labelled by source stream
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    stream: String,
}

impl PipelineMetrics {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn received(&self) {
        counter!("ingest_messages_received_total", "stream" => self.stream.clone()).increment(1);
    }

    pub fn succeeded(&self, duration: Duration) {
        counter!("ingest_messages_succeeded_total", "stream" => self.stream.clone()).increment(1);
        self.handled(duration, "succeeded");
    }

    pub fn retry_scheduled(&self, attempt: u32, delay: Duration) {
        counter!("ingest_retries_scheduled_total", "stream" => self.stream.clone()).increment(1);
        histogram!("ingest_retry_delay_seconds", "stream" => self.stream.clone())
            .record(delay.as_secs_f64());
        histogram!("ingest_retry_attempt", "stream" => self.stream.clone()).record(attempt as f64);
    }

    pub fn dead_lettered(&self, kind: ErrorKind, duration: Duration) {
        counter!(
            "ingest_messages_dead_lettered_total",
            "stream" => self.stream.clone(),
            "error_kind" => kind.to_string()
        )
        .increment(1);
        self.handled(duration, "dead_lettered");
    }

    /// A sink call failed (before or after its local retry)
    pub fn route_failed(&self, sink: &'static str) {
        counter!(
            "ingest_route_failures_total",
            "stream" => self.stream.clone(),
            "sink" => sink
        )
        .increment(1);
    }

    /// A failure record was lost because its sink failed twice
    pub fn dropped(&self, sink: &'static str) {
        counter!(
            "ingest_records_dropped_total",
            "stream" => self.stream.clone(),
            "sink" => sink
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!("ingest_in_flight_handlers", "stream" => self.stream.clone()).set(count as f64);
    }

    pub fn pending_retries(&self, count: usize) {
        gauge!("ingest_pending_retries", "stream" => self.stream.clone()).set(count as f64);
    }

    pub fn reclaimed(&self, count: usize) {
        counter!("ingest_messages_reclaimed_total", "stream" => self.stream.clone())
            .increment(count as u64);
    }

    fn handled(&self, duration: Duration, outcome: &'static str) {
        histogram!(
            "ingest_handle_duration_seconds",
            "stream" => self.stream.clone(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }
}
