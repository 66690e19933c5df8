use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "mma_scheduler";

/// Where the job engine reports what it is doing.
///
/// Injected at construction so the engine never touches process-wide state.
pub trait MetricsSink: Send + Sync {
    /// Record the outcome of a finished run.
    fn record_job_execution(&self, job_id: &str, status: &str, duration: Duration);

    fn set_job_running(&self, job_id: &str, running: bool);

    /// A trigger arrived while the job was already running.
    fn record_job_skipped(&self, job_id: &str);

    fn record_attempt_failure(&self, job_id: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_job_execution(&self, _job_id: &str, _status: &str, _duration: Duration) {}
    fn set_job_running(&self, _job_id: &str, _running: bool) {}
    fn record_job_skipped(&self, _job_id: &str) {}
    fn record_attempt_failure(&self, _job_id: &str) {}
}

/// Prometheus-backed sink with its own registry.
pub struct PrometheusMetrics {
    registry: Registry,
    executions_total: CounterVec,
    duration_seconds: HistogramVec,
    running: GaugeVec,
    skipped_total: CounterVec,
    attempt_failures_total: CounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions_total = CounterVec::new(
            Opts::new(
                format!("{PREFIX}_job_executions_total"),
                "Total number of background job runs",
            ),
            &["job_id", "status"],
        )?;
        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{PREFIX}_job_duration_seconds"),
                "Background job run duration in seconds, retries included",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
            &["job_id"],
        )?;
        let running = GaugeVec::new(
            Opts::new(
                format!("{PREFIX}_job_running"),
                "Whether a background job is currently running (1) or not (0)",
            ),
            &["job_id"],
        )?;
        let skipped_total = CounterVec::new(
            Opts::new(
                format!("{PREFIX}_job_skipped_total"),
                "Triggers skipped because the job was already running",
            ),
            &["job_id"],
        )?;
        let attempt_failures_total = CounterVec::new(
            Opts::new(
                format!("{PREFIX}_job_attempt_failures_total"),
                "Failed attempts, including ones that were later retried",
            ),
            &["job_id"],
        )?;

        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(running.clone()))?;
        registry.register(Box::new(skipped_total.clone()))?;
        registry.register(Box::new(attempt_failures_total.clone()))?;

        Ok(Self {
            registry,
            executions_total,
            duration_seconds,
            running,
            skipped_total,
            attempt_failures_total,
        })
    }

    /// Encode every registered metric in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_job_execution(&self, job_id: &str, status: &str, duration: Duration) {
        self.executions_total
            .with_label_values(&[job_id, status])
            .inc();
        self.duration_seconds
            .with_label_values(&[job_id])
            .observe(duration.as_secs_f64());
    }

    fn set_job_running(&self, job_id: &str, running: bool) {
        self.running
            .with_label_values(&[job_id])
            .set(if running { 1.0 } else { 0.0 });
    }

    fn record_job_skipped(&self, job_id: &str) {
        self.skipped_total.with_label_values(&[job_id]).inc();
    }

    fn record_attempt_failure(&self, job_id: &str) {
        self.attempt_failures_total
            .with_label_values(&[job_id])
            .inc();
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn run_metrics_server(
    metrics: Arc<PrometheusMetrics>,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Metrics available at port {}", port);
    axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_sink_records_job_metrics() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_job_running("rankings", true);
        metrics.record_attempt_failure("rankings");
        metrics.record_job_execution("rankings", "success", Duration::from_secs(3));
        metrics.record_job_skipped("rankings");

        let output = metrics.render().unwrap();
        assert!(output.contains("mma_scheduler_job_executions_total{job_id=\"rankings\",status=\"success\"} 1"));
        assert!(output.contains("mma_scheduler_job_running{job_id=\"rankings\"} 1"));
        assert!(output.contains("mma_scheduler_job_skipped_total{job_id=\"rankings\"} 1"));
        assert!(output.contains("mma_scheduler_job_attempt_failures_total{job_id=\"rankings\"} 1"));
    }

    #[test]
    fn test_separate_sinks_do_not_share_state() {
        let first = PrometheusMetrics::new().unwrap();
        let second = PrometheusMetrics::new().unwrap();
        first.record_job_skipped("archive");

        assert!(first.render().unwrap().contains("job_skipped_total"));
        assert!(!second.render().unwrap().contains("job_skipped_total{"));
    }

    #[tokio::test]
    async fn test_metrics_handler_serves_text() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        metrics.set_job_running("cleanup", false);

        let response = metrics_handler(State(metrics)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
