//! MMA Scheduler Library
//!
//! Background job orchestration for the fight data platform: cron
//! scheduling, single-flight runs with retries, and the maintenance jobs
//! themselves. Modules are exposed for the binary and for testing.

pub mod background_jobs;
pub mod config;
pub mod datastore;
pub mod scraper;
pub mod server;

// Re-export commonly used types for convenience
pub use background_jobs::{BackgroundJob, JobContext, JobError, Scheduler, SchedulerError};
pub use datastore::SqliteDatastore;
pub use server::{MetricsSink, NoopMetrics, PrometheusMetrics};
