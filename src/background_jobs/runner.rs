//! Single-flight execution with retry and timeout.

use super::context::JobContext;
use super::job::{BackgroundJob, JobError};
use super::schedule::JobDefinition;
use crate::server::metrics::MetricsSink;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run statistics for one job. In memory only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub is_running: bool,
    pub success_count: u64,
    pub fail_count: u64,
}

/// Delay between attempts: `attempt * backoff_base`, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }
}

/// What happened to one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded { attempts: u32 },
    Failed(JobError),
    /// The job was already running, nothing was done.
    Skipped,
}

type StatusMap = Arc<RwLock<HashMap<String, JobStatus>>>;

/// Wraps job bodies with a per-job try-lock, a per-attempt deadline and a
/// retry loop, and keeps each job's [`JobStatus`] up to date.
pub struct SingleFlightRunner {
    locks: HashMap<String, Arc<AsyncMutex<()>>>,
    statuses: StatusMap,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl SingleFlightRunner {
    pub fn new<I, S>(job_names: I, retry: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut locks = HashMap::new();
        let mut statuses = HashMap::new();
        for name in job_names {
            let name = name.into();
            locks.insert(name.clone(), Arc::new(AsyncMutex::new(())));
            statuses.insert(name, JobStatus::default());
        }
        Self {
            locks,
            statuses: Arc::new(RwLock::new(statuses)),
            retry,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Snapshot of a job's status.
    pub fn status(&self, name: &str) -> Option<JobStatus> {
        let statuses = self.statuses.read().unwrap_or_else(|e| e.into_inner());
        statuses.get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.status(name).map(|s| s.is_running).unwrap_or(false)
    }

    pub fn any_running(&self) -> bool {
        let statuses = self.statuses.read().unwrap_or_else(|e| e.into_inner());
        statuses.values().any(|s| s.is_running)
    }

    /// Ask every in-flight attempt to stop and prevent further retries.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Run `job` under its definition. Returns once the run is over,
    /// including every retry and backoff.
    pub async fn run(
        &self,
        job: Arc<dyn BackgroundJob>,
        definition: &JobDefinition,
        triggered_by: &str,
    ) -> RunOutcome {
        let name = definition.name.as_str();
        let Some(lock) = self.locks.get(name).cloned() else {
            error!("Attempted to run unknown job: {}", name);
            return RunOutcome::Failed(JobError::ExecutionFailed(format!(
                "job {} is not registered",
                name
            )));
        };

        let _lock_guard = match lock.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!(
                    "Job {} already running, skipping {} trigger",
                    name, triggered_by
                );
                self.metrics.record_job_skipped(name);
                return RunOutcome::Skipped;
            }
        };

        self.update_status(name, |status| {
            status.is_running = true;
            status.last_run = Some(Utc::now());
        });
        self.metrics.set_job_running(name, true);
        let _running_guard = RunningGuard {
            statuses: Arc::clone(&self.statuses),
            metrics: Arc::clone(&self.metrics),
            name: name.to_string(),
        };

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            name, run_id, triggered_by
        );

        let attempts = definition.max_retries.max(1);
        let mut last_error = None;

        // One deadline for the whole run, retries and backoff included.
        let deadline = Instant::now() + definition.timeout;

        for attempt in 1..=attempts {
            let ctx = JobContext::with_deadline(
                name,
                run_id,
                self.shutdown.child_token(),
                deadline,
            );

            let result = match ctx.check() {
                Ok(()) => run_attempt(Arc::clone(&job), ctx).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    self.update_status(name, |status| status.success_count += 1);
                    let elapsed = started.elapsed();
                    info!(
                        "Job {} completed successfully in {:?} (attempt {}/{})",
                        name, elapsed, attempt, attempts
                    );
                    self.metrics.record_job_execution(name, "success", elapsed);
                    return RunOutcome::Succeeded { attempts: attempt };
                }
                Err(err) => {
                    self.update_status(name, |status| status.fail_count += 1);
                    self.metrics.record_attempt_failure(name);
                    warn!(
                        "Job {} attempt {}/{} failed: {}",
                        name, attempt, attempts, err
                    );
                    last_error = Some(err);
                }
            }

            if last_error == Some(JobError::Timeout) {
                debug!("Not retrying job {}: run deadline passed", name);
                break;
            }

            if attempt < attempts {
                if self.shutdown.is_cancelled() {
                    debug!("Not retrying job {}: shutting down", name);
                    break;
                }
                let delay = self.retry.delay_for(attempt);
                info!("Retrying job {} in {:?}", name, delay);
                let wake = (Instant::now() + delay).min(deadline);
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    _ = self.shutdown.cancelled() => {
                        debug!("Backoff for job {} interrupted by shutdown", name);
                        break;
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or(JobError::Cancelled);
        let elapsed = started.elapsed();
        error!("Job {} failed after {:?}: {}", name, elapsed, last_error);
        self.metrics
            .record_job_execution(name, last_error.label(), elapsed);
        let recorded = last_error.clone();
        self.update_status(name, move |status| status.last_error = Some(recorded));
        RunOutcome::Failed(last_error)
    }

    fn update_status(&self, name: &str, update: impl FnOnce(&mut JobStatus)) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = statuses.get_mut(name) {
            update(status);
        }
    }
}

/// Clears the running flag however the run ends.
struct RunningGuard {
    statuses: StatusMap,
    metrics: Arc<dyn MetricsSink>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = statuses.get_mut(&self.name) {
            status.is_running = false;
        }
        self.metrics.set_job_running(&self.name, false);
    }
}

/// One attempt in its own task, so a panic is contained and the deadline
/// can be enforced even if the job never polls its context.
async fn run_attempt(job: Arc<dyn BackgroundJob>, ctx: JobContext) -> Result<(), JobError> {
    let task_ctx = ctx.clone();
    let mut handle = tokio::spawn(async move { job.run(&task_ctx).await });

    tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::Panicked(e.to_string())),
            Err(_) => Err(JobError::Cancelled),
        },
        err = ctx.done() => {
            ctx.cancellation_token.cancel();
            handle.abort();
            let _ = handle.await;
            Err(err)
        }
    }
}
