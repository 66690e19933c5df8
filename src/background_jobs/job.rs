use super::context::JobContext;
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can end a job run or one of its attempts.
///
/// Cloneable so the final error of a run can be kept in the job's status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Subtask {name} failed: {reason}")]
    Subtask { name: String, reason: String },

    #[error("{} subtasks failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<JobError>),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job timed out")]
    Timeout,

    #[error("Verification failed after commit: {0}")]
    Verification(String),

    #[error("Task panic: {0}")]
    Panicked(String),
}

fn join_errors(errors: &[JobError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl JobError {
    /// Label used when reporting run outcomes to the metrics sink.
    pub fn label(&self) -> &'static str {
        match self {
            JobError::Cancelled => "cancelled",
            JobError::Timeout => "timeout",
            JobError::Panicked(_) => "panic",
            JobError::Verification(_) => "verification_failed",
            _ => "failed",
        }
    }

    /// Whether the error came from the run's own context ending rather
    /// than from the work itself.
    pub fn is_context_error(&self) -> bool {
        matches!(self, JobError::Cancelled | JobError::Timeout)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::ExecutionFailed(format!("{:#}", err))
    }
}

/// Trait for background jobs.
///
/// Every job exposes the same entry point, so the single-flight runner
/// can drive any of them without knowing what they do. Long-running
/// work should poll `ctx` and return early once it reports done.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Unique identifier, also the key in the job definition map.
    fn id(&self) -> &'static str;

    /// Human-readable name for this job.
    fn name(&self) -> &'static str;

    /// Description of what this job does.
    fn description(&self) -> &'static str;

    /// Run the job once.
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}
