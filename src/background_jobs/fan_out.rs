//! Structured fan-out/fan-in for job subtasks.
//!
//! Subtasks run concurrently on a [`JoinSet`], each with a child context of
//! the group. The group resolves once: to the parent context's error, to the
//! first subtask error, or to success when every subtask returned `Ok`.
//! On error or cancellation the remaining subtasks are cancelled and then
//! aborted, so no subtask outlives the call.

use super::context::JobContext;
use super::job::JobError;
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

type SubtaskResult = (String, Result<(), JobError>);

pub struct FanOut {
    parent: JobContext,
    group: JobContext,
    tasks: JoinSet<SubtaskResult>,
    grace: Duration,
}

impl FanOut {
    pub fn new(ctx: &JobContext) -> Self {
        Self {
            parent: ctx.clone(),
            group: ctx.child(),
            tasks: JoinSet::new(),
            grace: Duration::ZERO,
        }
    }

    /// Time given to cancelled subtasks to finish on their own before they
    /// are aborted.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start a subtask. It receives its own child context.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        let fut = task(self.group.child());
        self.tasks.spawn(async move { (name, fut.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the group, failing fast on the first error.
    pub async fn join(mut self) -> Result<(), JobError> {
        let result = loop {
            tokio::select! {
                biased;
                err = self.parent.done() => break Err(err),
                next = self.tasks.join_next() => match next {
                    None => break Ok(()),
                    Some(Ok((name, Ok(())))) => {
                        debug!("[{}] subtask {} finished", self.parent.job_id, name);
                    }
                    Some(Ok((name, Err(err)))) => break Err(subtask_error(name, err)),
                    Some(Err(join_err)) => break Err(join_error(join_err)),
                },
            }
        };

        if result.is_err() {
            self.cancel_remaining().await;
        }
        result
    }

    /// Wait for every subtask and report all of their errors.
    ///
    /// The parent context ending still cuts the wait short.
    pub async fn join_all(mut self) -> Result<(), JobError> {
        let mut errors = Vec::new();
        loop {
            tokio::select! {
                biased;
                err = self.parent.done() => {
                    self.cancel_remaining().await;
                    errors.push(err);
                    break;
                }
                next = self.tasks.join_next() => match next {
                    None => break,
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((name, Err(err)))) => errors.push(subtask_error(name, err)),
                    Some(Err(join_err)) => errors.push(join_error(join_err)),
                },
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(JobError::Multiple(errors)),
        }
    }

    async fn cancel_remaining(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        debug!(
            "[{}] cancelling {} remaining subtasks",
            self.parent.job_id,
            self.tasks.len()
        );
        self.group.cancellation_token.cancel();

        if !self.grace.is_zero() {
            let drained = tokio::time::timeout(self.grace, async {
                while self.tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "[{}] {} subtasks still running after {:?}, aborting",
                    self.parent.job_id,
                    self.tasks.len(),
                    self.grace
                );
            }
        }
        self.tasks.shutdown().await;
    }
}

fn subtask_error(name: String, err: JobError) -> JobError {
    match err {
        JobError::Cancelled | JobError::Timeout | JobError::Subtask { .. } => err,
        other => JobError::Subtask {
            name,
            reason: other.to_string(),
        },
    }
}

fn join_error(err: JoinError) -> JobError {
    if err.is_panic() {
        JobError::Panicked(err.to_string())
    } else {
        JobError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> JobContext {
        JobContext::new(
            "fan_out_test",
            Uuid::new_v4(),
            CancellationToken::new(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_all_subtasks_succeed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut fan = FanOut::new(&ctx());
        for i in 0..4 {
            let count = count.clone();
            fan.spawn(format!("task-{}", i), move |_ctx| async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(fan.len(), 4);

        assert!(fan.join().await.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_already_cancelled_context_returns_cancellation() {
        let ctx = ctx();
        ctx.cancellation_token.cancel();

        let mut fan = FanOut::new(&ctx);
        for i in 0..3 {
            fan.spawn(format!("never-{}", i), |_ctx| async move {
                std::future::pending::<()>().await;
                Ok(())
            });
        }

        let result = tokio::time::timeout(Duration::from_secs(5), fan.join())
            .await
            .expect("fan-out should resolve immediately");
        assert_eq!(result, Err(JobError::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_fast_does_not_wait_for_siblings() {
        let sibling_saw_cancel = Arc::new(AtomicBool::new(false));
        let mut fan = FanOut::new(&ctx());

        fan.spawn("broken", |_ctx| async move {
            Err(JobError::ExecutionFailed("bad row".to_string()))
        });
        for i in 0..3 {
            fan.spawn(format!("stuck-{}", i), |_ctx| async move {
                std::future::pending::<()>().await;
                Ok(())
            });
        }
        let flag = sibling_saw_cancel.clone();
        fan.spawn("polite", move |ctx| async move {
            ctx.cancellation_token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Err(JobError::Cancelled)
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            fan.with_grace(Duration::from_millis(200)).join(),
        )
        .await
        .expect("fan-out should not wait on stuck subtasks");

        assert_eq!(
            result,
            Err(JobError::Subtask {
                name: "broken".to_string(),
                reason: "Execution failed: bad row".to_string(),
            })
        );
        assert!(sibling_saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_children_are_gone_when_join_returns() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut fan = FanOut::new(&ctx());

        fan.spawn("fails", |_ctx| async move {
            Err(JobError::ExecutionFailed("nope".to_string()))
        });
        let flag = finished.clone();
        fan.spawn("slow", move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(fan.join().await.is_err());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !finished.load(Ordering::SeqCst),
            "aborted subtask must not keep running"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_group() {
        let ctx = JobContext::new(
            "fan_out_test",
            Uuid::new_v4(),
            CancellationToken::new(),
            Duration::from_secs(2),
        );
        let mut fan = FanOut::new(&ctx);
        fan.spawn("long", |ctx| async move {
            ctx.sleep(Duration::from_secs(3600)).await
        });

        assert_eq!(fan.join().await, Err(JobError::Timeout));
    }

    #[tokio::test]
    async fn test_join_all_collects_every_error() {
        let mut fan = FanOut::new(&ctx());
        fan.spawn("ok", |_ctx| async move { Ok(()) });
        fan.spawn("first", |_ctx| async move {
            Err(JobError::ExecutionFailed("one".to_string()))
        });
        fan.spawn("second", |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(JobError::ExecutionFailed("two".to_string()))
        });

        match fan.join_all().await {
            Err(JobError::Multiple(errors)) => {
                assert_eq!(errors.len(), 2);
                let names: Vec<_> = errors
                    .iter()
                    .map(|e| match e {
                        JobError::Subtask { name, .. } => name.clone(),
                        other => panic!("unexpected error {:?}", other),
                    })
                    .collect();
                assert!(names.contains(&"first".to_string()));
                assert!(names.contains(&"second".to_string()));
            }
            other => panic!("expected aggregated errors, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_subtask_is_reported() {
        let mut fan = FanOut::new(&ctx());
        fan.spawn("panics", |_ctx| async move {
            if true {
                panic!("subtask exploded");
            }
            Ok(())
        });

        assert!(matches!(fan.join().await, Err(JobError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_empty_group_succeeds() {
        let fan = FanOut::new(&ctx());
        assert!(fan.is_empty());
        assert!(fan.join().await.is_ok());
    }
}
