//! Prometheus metrics for the messaging core.
//!
//! Covers:
//! - Publishing (count, failures, broker confirmation latency)
//! - Listener dispatch (acks, handler errors, poison messages)
//! - Replica transitions (applied, ignored, rejected)
//!
//! Without an installed recorder every call is a no-op, so libraries record
//! unconditionally and only the binary decides whether to export.
//!
//! # Example
//!
//! ```rust,no_run
//! use ticketbus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::Subject;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and serve `/metrics` on the configured
    /// address.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already
    /// installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = prometheus_builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Exporter builder with latency buckets for `*_duration_seconds`.
fn prometheus_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    // Publisher
    describe_counter!(
        "ticketbus_messages_published_total",
        "Messages durably stored by the broker"
    );
    describe_counter!(
        "ticketbus_publish_errors_total",
        "Publishes that failed or timed out"
    );
    describe_histogram!(
        "ticketbus_publish_duration_seconds",
        "Time until the broker confirmed storage"
    );

    // Listener
    describe_counter!(
        "ticketbus_messages_acked_total",
        "Messages handled and acknowledged"
    );
    describe_counter!(
        "ticketbus_handler_errors_total",
        "Handler failures left for redelivery"
    );
    describe_counter!(
        "ticketbus_poison_messages_total",
        "Deliveries whose payload did not decode"
    );
    describe_counter!(
        "ticketbus_ack_errors_total",
        "Acknowledgments the broker did not accept"
    );
    describe_counter!(
        "ticketbus_stream_errors_total",
        "Errors surfaced by a subscription stream"
    );

    // Replicas
    describe_counter!(
        "ticketbus_replica_applied_total",
        "Replica transitions applied"
    );
    describe_counter!(
        "ticketbus_replica_ignored_total",
        "Idempotent no-op transitions"
    );
    describe_counter!(
        "ticketbus_replica_rejected_total",
        "Transitions rejected by the version guard"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a confirmed publish.
    pub fn record_published(subject: Subject, duration: Duration) {
        counter!("ticketbus_messages_published_total", "subject" => subject.as_str()).increment(1);
        histogram!("ticketbus_publish_duration_seconds", "subject" => subject.as_str())
            .record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_error(subject: Subject) {
        counter!("ticketbus_publish_errors_total", "subject" => subject.as_str()).increment(1);
    }
}

/// Listener metrics recorder.
pub struct ListenerMetrics;

impl ListenerMetrics {
    /// Record an acknowledged message.
    pub fn record_acked(subject: Subject) {
        counter!("ticketbus_messages_acked_total", "subject" => subject.as_str()).increment(1);
    }

    /// Record a handler failure.
    pub fn record_handler_error(subject: Subject) {
        counter!("ticketbus_handler_errors_total", "subject" => subject.as_str()).increment(1);
    }

    /// Record a poison message.
    pub fn record_poison(subject: Subject) {
        counter!("ticketbus_poison_messages_total", "subject" => subject.as_str()).increment(1);
    }

    /// Record a failed acknowledgment.
    pub fn record_ack_error(subject: Subject) {
        counter!("ticketbus_ack_errors_total", "subject" => subject.as_str()).increment(1);
    }

    /// Record an error item on the subscription stream.
    pub fn record_stream_error(subject: Subject) {
        counter!("ticketbus_stream_errors_total", "subject" => subject.as_str()).increment(1);
    }
}

/// Replica store metrics recorder.
pub struct ReplicaMetrics;

impl ReplicaMetrics {
    /// Record an applied transition (`created`, `updated`, `deleted`).
    pub fn record_applied(kind: &'static str, transition: &'static str) {
        counter!("ticketbus_replica_applied_total", "kind" => kind, "transition" => transition)
            .increment(1);
    }

    /// Record a no-op transition.
    pub fn record_ignored(kind: &'static str, reason: &'static str) {
        counter!("ticketbus_replica_ignored_total", "kind" => kind, "reason" => reason)
            .increment(1);
    }

    /// Record a rejected transition.
    pub fn record_rejected(kind: &'static str, reason: &'static str) {
        counter!("ticketbus_replica_rejected_total", "kind" => kind, "reason" => reason)
            .increment(1);
    }
}
