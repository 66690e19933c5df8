//! Observability surface: the metrics sink used by the job runner and the
//! Prometheus endpoint that exposes it.

pub mod metrics;

pub use metrics::{run_metrics_server, MetricsSink, NoopMetrics, PrometheusMetrics};
