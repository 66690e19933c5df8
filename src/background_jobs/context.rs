use super::job::JobError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context provided to jobs during execution.
///
/// One context is derived per attempt. It carries the run's deadline,
/// shared by every attempt, and a cancellation token that the runner (on
/// timeout or shutdown) and the fan-out helper (on a failing sibling) use
/// to ask work to stop.
#[derive(Clone, Debug)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Point in time after which the run counts as timed out.
    pub deadline: Instant,

    /// Identifier shared by every attempt of the same run.
    pub run_id: Uuid,

    /// Name of the job being run.
    pub job_id: String,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        run_id: Uuid,
        cancellation_token: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            cancellation_token,
            deadline: Instant::now() + timeout,
            run_id,
            job_id: job_id.into(),
        }
    }

    /// Context for one attempt of a run whose deadline is already fixed.
    pub fn with_deadline(
        job_id: impl Into<String>,
        run_id: Uuid,
        cancellation_token: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            cancellation_token,
            deadline,
            run_id,
            job_id: job_id.into(),
        }
    }

    /// Derive a context whose token is cancelled along with this one but
    /// can also be cancelled on its own. The deadline is inherited.
    pub fn child(&self) -> Self {
        Self {
            cancellation_token: self.cancellation_token.child_token(),
            deadline: self.deadline,
            run_id: self.run_id,
            job_id: self.job_id.clone(),
        }
    }

    /// Check if cancellation has been requested or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Return the context error if the context is already done.
    pub fn check(&self) -> Result<(), JobError> {
        if Instant::now() >= self.deadline {
            Err(JobError::Timeout)
        } else if self.cancellation_token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the context is done, with the reason.
    pub async fn done(&self) -> JobError {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                if Instant::now() >= self.deadline {
                    JobError::Timeout
                } else {
                    JobError::Cancelled
                }
            }
            _ = tokio::time::sleep_until(self.deadline) => JobError::Timeout,
        }
    }

    /// Sleep for `duration`, returning early with the context error if
    /// the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            err = self.done() => Err(err),
        }
    }
}
