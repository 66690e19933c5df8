use super::job::BackgroundJob;
use super::runner::{JobStatus, RetryPolicy, RunOutcome, SingleFlightRunner};
use super::schedule::{CronSchedule, JobDefinition};
use crate::server::metrics::MetricsSink;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors returned by the scheduler API.
///
/// `InvalidSchedule` and `InvalidTimeout` are configuration errors and
/// abort [`Scheduler::start`] before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid schedule for {job} job: {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("invalid timeout for {job} job: must be greater than zero")]
    InvalidTimeout { job: String },

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} is disabled")]
    Disabled(String),

    #[error("job {0} has no registered implementation")]
    Unregistered(String),

    #[error("scheduler already started")]
    AlreadyStarted,
}

#[derive(Clone)]
struct JobEntry {
    definition: JobDefinition,
    job: Option<Arc<dyn BackgroundJob>>,
}

/// Summary of one job for listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub description: Option<String>,
    pub schedule: String,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

struct Dispatcher {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Triggers jobs on their cron schedules through a [`SingleFlightRunner`].
pub struct Scheduler {
    entries: HashMap<String, JobEntry>,
    runner: Arc<SingleFlightRunner>,
    dispatcher: Option<Dispatcher>,
}

impl Scheduler {
    pub fn new(
        definitions: HashMap<String, JobDefinition>,
        retry: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let runner = Arc::new(SingleFlightRunner::new(
            definitions.keys().cloned(),
            retry,
            metrics,
        ));
        let entries = definitions
            .into_iter()
            .map(|(name, definition)| {
                (
                    name,
                    JobEntry {
                        definition,
                        job: None,
                    },
                )
            })
            .collect();
        Self {
            entries,
            runner,
            dispatcher: None,
        }
    }

    /// Attach the implementation for a defined job.
    pub fn register_job(&mut self, job: Arc<dyn BackgroundJob>) -> Result<(), SchedulerError> {
        let job_id = job.id();
        let entry = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
        info!("Registering job: {} - {}", job_id, job.description());
        entry.job = Some(job);
        Ok(())
    }

    /// Start the cron dispatcher.
    ///
    /// Every enabled job is validated first; if any is invalid nothing is
    /// started. Disabled jobs are never parsed.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.dispatcher.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let mut scheduled = Vec::new();
        for (name, entry) in &self.entries {
            if !entry.definition.enabled {
                info!("Job {} is disabled, not scheduling", name);
                continue;
            }
            let schedule = entry.definition.parse_schedule()?;
            let job = entry
                .job
                .clone()
                .ok_or_else(|| SchedulerError::Unregistered(name.clone()))?;
            scheduled.push(ScheduledJob {
                schedule,
                definition: entry.definition.clone(),
                job,
            });
        }
        scheduled.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));

        for job in &scheduled {
            info!(
                "Scheduled job {} with schedule {}",
                job.definition.name,
                job.schedule.expression()
            );
        }
        info!("Starting job scheduler with {} scheduled jobs", scheduled.len());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatch(
            scheduled,
            Arc::clone(&self.runner),
            shutdown.clone(),
        ));
        self.dispatcher = Some(Dispatcher { shutdown, handle });
        Ok(())
    }

    /// Number of jobs the dispatcher triggers.
    pub fn scheduled_count(&self) -> usize {
        if self.dispatcher.is_none() {
            return 0;
        }
        self.entries
            .values()
            .filter(|e| e.definition.enabled && e.job.is_some())
            .count()
    }

    pub fn is_started(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Stop triggering new runs and wait for the dispatcher to exit.
    /// Runs already in flight keep going.
    pub async fn stop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown.cancel();
            if let Err(e) = dispatcher.handle.await {
                error!("Scheduler dispatcher task failed: {}", e);
            }
            info!("Job scheduler stopped");
        }
    }

    /// Stop the dispatcher, ask in-flight runs to cancel and wait up to
    /// `grace` for them to finish.
    pub async fn shutdown(&mut self, grace: Duration) {
        info!("Shutting down scheduler...");
        self.stop().await;
        self.runner.cancel_all();

        let waited = tokio::time::timeout(grace, async {
            while self.runner.any_running() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!("Some jobs were still running after {:?}", grace);
        }
        info!("Scheduler shutdown complete");
    }

    /// Trigger a job in the background. Returns as soon as the run is
    /// spawned, not when it finishes.
    pub fn run_job_manually(&self, name: &str) -> Result<(), SchedulerError> {
        let (definition, job) = self.runnable(name)?;
        info!("Manually triggering job {}", name);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            runner.run(job, &definition, "manual").await;
        });
        Ok(())
    }

    /// Run a job and wait for the outcome.
    pub async fn run_job_now(&self, name: &str) -> Result<RunOutcome, SchedulerError> {
        let (definition, job) = self.runnable(name)?;
        Ok(self.runner.run(job, &definition, "cli").await)
    }

    pub fn get_job_status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        self.runner
            .status(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    /// Every defined job, sorted by name.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        let mut jobs: Vec<JobInfo> = self
            .entries
            .iter()
            .map(|(name, entry)| {
                let next_run_at = if entry.definition.enabled {
                    CronSchedule::parse(&entry.definition.schedule)
                        .ok()
                        .and_then(|s| s.next_after(&now))
                } else {
                    None
                };
                JobInfo {
                    id: name.clone(),
                    description: entry.job.as_ref().map(|j| j.description().to_string()),
                    schedule: entry.definition.schedule.clone(),
                    enabled: entry.definition.enabled,
                    timeout_secs: entry.definition.timeout.as_secs(),
                    max_retries: entry.definition.max_retries,
                    next_run_at,
                    is_running: self.runner.is_running(name),
                }
            })
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    fn runnable(
        &self,
        name: &str,
    ) -> Result<(JobDefinition, Arc<dyn BackgroundJob>), SchedulerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        if !entry.definition.enabled {
            return Err(SchedulerError::Disabled(name.to_string()));
        }
        let job = entry
            .job
            .clone()
            .ok_or_else(|| SchedulerError::Unregistered(name.to_string()))?;
        Ok((entry.definition.clone(), job))
    }
}

struct ScheduledJob {
    schedule: CronSchedule,
    definition: JobDefinition,
    job: Arc<dyn BackgroundJob>,
}

/// Dispatcher loop: sleep until the soonest fire time, spawn every due
/// job, repeat until `shutdown` is cancelled.
async fn dispatch(
    jobs: Vec<ScheduledJob>,
    runner: Arc<SingleFlightRunner>,
    shutdown: CancellationToken,
) {
    let now = Utc::now();
    let mut next_runs: Vec<Option<DateTime<Utc>>> =
        jobs.iter().map(|j| j.schedule.next_after(&now)).collect();

    loop {
        let Some(soonest) = next_runs.iter().flatten().min().copied() else {
            info!("No upcoming scheduled runs, dispatcher idle until stopped");
            shutdown.cancelled().await;
            break;
        };

        let sleep_duration = (soonest - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(
            "Scheduler sleeping for {:?} until next scheduled job",
            sleep_duration
        );

        tokio::select! {
            _ = tokio::time::sleep(sleep_duration) => {}
            _ = shutdown.cancelled() => {
                info!("Scheduler received shutdown signal");
                break;
            }
        }

        let now = Utc::now();
        for (job, next_run) in jobs.iter().zip(next_runs.iter_mut()) {
            match *next_run {
                Some(at) if at <= now => {
                    let runner = Arc::clone(&runner);
                    let definition = job.definition.clone();
                    let body = Arc::clone(&job.job);
                    tokio::spawn(async move {
                        runner.run(body, &definition, "schedule").await;
                    });
                    *next_run = job.schedule.next_after(&now);
                }
                _ => {}
            }
        }
    }
}
