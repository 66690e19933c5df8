//! Metrics aggregation background job.
//!
//! Computes fighter, event and finish statistics and stores each as a JSON
//! snapshot. All three are attempted even if one fails; the ranking summary
//! is refreshed once they all succeeded.

use crate::background_jobs::{BackgroundJob, FanOut, JobContext, JobError};
use crate::datastore::{MetricKind, RankingStore, StatsStore};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct MetricsJob {
    stats: Arc<dyn StatsStore>,
    rankings: Arc<dyn RankingStore>,
}

impl MetricsJob {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: StatsStore + RankingStore + 'static,
    {
        Self {
            stats: store.clone(),
            rankings: store,
        }
    }

    async fn store<T: Serialize>(
        &self,
        ctx: &JobContext,
        kind: MetricKind,
        value: &T,
    ) -> Result<(), JobError> {
        ctx.check()?;
        let data = serde_json::to_value(value).map_err(|e| {
            JobError::ExecutionFailed(format!("Failed to encode {}: {}", kind.as_str(), e))
        })?;
        self.stats.store_metric(kind, &data, Utc::now()).await?;
        debug!("[{}] stored {} snapshot", ctx.job_id, kind.as_str());
        Ok(())
    }

    async fn fighter_stats(&self, ctx: &JobContext) -> Result<(), JobError> {
        let stats = self.stats.fighter_stats().await?;
        self.store(ctx, MetricKind::FighterStats, &stats).await
    }

    async fn event_stats(&self, ctx: &JobContext) -> Result<(), JobError> {
        let since = Utc::now() - ChronoDuration::days(365);
        let stats = self.stats.event_stats(since).await?;
        self.store(ctx, MetricKind::EventStats, &stats).await
    }

    async fn finish_stats(&self, ctx: &JobContext) -> Result<(), JobError> {
        let stats = self.stats.finish_stats().await?;
        self.store(ctx, MetricKind::FinishStats, &stats).await
    }
}

#[async_trait]
impl BackgroundJob for MetricsJob {
    fn id(&self) -> &'static str {
        "metrics"
    }

    fn name(&self) -> &'static str {
        "Metrics"
    }

    fn description(&self) -> &'static str {
        "Aggregate fighter, event and finish statistics"
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;

        let mut group = FanOut::new(ctx);
        let job = self.clone();
        group.spawn("fighter_stats", move |ctx| async move { job.fighter_stats(&ctx).await });
        let job = self.clone();
        group.spawn("event_stats", move |ctx| async move { job.event_stats(&ctx).await });
        let job = self.clone();
        group.spawn("finish_stats", move |ctx| async move { job.finish_stats(&ctx).await });
        group.join_all().await?;

        self.rankings.refresh_ranking_views().await?;
        info!("[{}] metrics updated", ctx.job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{Fighter, SqliteDatastore};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_metrics_snapshots_stored() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteDatastore::new(temp_dir.path().join("mma.db")).unwrap());
        let mut fighter = Fighter::new("a", "A", "featherweight");
        fighter.age = Some(29);
        store.insert_fighter(&fighter).unwrap();

        let job = MetricsJob::new(store.clone());
        assert_eq!(job.id(), "metrics");
        let ctx = JobContext::new(
            job.id(),
            Uuid::new_v4(),
            CancellationToken::new(),
            Duration::from_secs(30),
        );
        job.run(&ctx).await.unwrap();

        let fighters = store.latest_metric(MetricKind::FighterStats).unwrap().unwrap();
        assert_eq!(fighters["total_active"], 1);
        assert_eq!(fighters["weight_class_distribution"]["featherweight"], 1);

        let events = store.latest_metric(MetricKind::EventStats).unwrap().unwrap();
        assert_eq!(events["total_events"], 0);
        assert!(events["average_attendance"].is_null());

        assert!(store.latest_metric(MetricKind::FinishStats).unwrap().is_some());
    }
}
