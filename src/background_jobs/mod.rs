//! Background job scheduling and execution system.
//!
//! The scheduler fires jobs on cron schedules, the single-flight runner
//! wraps every run with a per-job lock, a deadline and retries, and jobs
//! split their work into concurrent subtasks with [`FanOut`].

mod context;
mod fan_out;
mod job;
pub mod jobs;
mod runner;
mod schedule;
mod scheduler;

pub use context::JobContext;
pub use fan_out::FanOut;
pub use job::{BackgroundJob, JobError};
pub use runner::{JobStatus, RetryPolicy, RunOutcome, SingleFlightRunner};
pub use schedule::{CronSchedule, JobDefinition};
pub use scheduler::{JobInfo, Scheduler, SchedulerError};
