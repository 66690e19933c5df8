//! Cleanup background job.
//!
//! Five independent maintenance passes run concurrently: expired media,
//! duplicate fighters and events, orphaned media, integrity validation and
//! flagging finished fights past the retention period.

use crate::background_jobs::{BackgroundJob, FanOut, JobContext, JobError};
use crate::datastore::{EventStore, FightStore, FighterStore, MediaStore};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_media_age_days: u32,
    /// Finished fights older than this are flagged as archived.
    pub retention_days: u32,
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_media_age_days: 90,
            retention_days: 365,
            batch_size: 100,
        }
    }
}

#[derive(Clone)]
pub struct CleanupJob {
    fighters: Arc<dyn FighterStore>,
    fights: Arc<dyn FightStore>,
    events: Arc<dyn EventStore>,
    media: Arc<dyn MediaStore>,
    config: CleanupConfig,
}

impl CleanupJob {
    pub fn new<S>(store: Arc<S>, config: CleanupConfig) -> Self
    where
        S: FighterStore + FightStore + EventStore + MediaStore + 'static,
    {
        Self {
            fighters: store.clone(),
            fights: store.clone(),
            events: store.clone(),
            media: store,
            config,
        }
    }

    async fn delete_expired_media(&self, ctx: &JobContext) -> Result<(), JobError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.max_media_age_days as i64);
        // Deleted rows shift later rows down, so only failed rows advance
        // the offset.
        let mut offset = 0;
        let mut deleted = 0;
        loop {
            ctx.check()?;
            let batch = self
                .media
                .get_media_before(cutoff, self.config.batch_size, offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            for media in &batch {
                match self.media.delete_media(&media.id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        offset += 1;
                        warn!(
                            "[{}] failed to delete media {}: {:#}",
                            ctx.job_id, media.id, e
                        );
                    }
                }
            }
        }

        info!("[{}] deleted {} expired media items", ctx.job_id, deleted);
        Ok(())
    }

    async fn remove_duplicates(&self, ctx: &JobContext) -> Result<(), JobError> {
        let fighter_groups = self.fighters.get_duplicate_fighters().await?;
        let mut merged = 0;
        for group in &fighter_groups {
            ctx.check()?;
            self.fighters
                .merge_fighters(&group.keep, &group.duplicates)
                .await?;
            merged += group.duplicates.len();
        }

        let event_groups = self.events.get_duplicate_events().await?;
        let mut deleted = 0;
        for group in &event_groups {
            for duplicate in &group.duplicates {
                ctx.check()?;
                self.events.delete_event(duplicate).await?;
                deleted += 1;
            }
        }

        info!(
            "[{}] merged {} duplicate fighters, deleted {} duplicate events",
            ctx.job_id, merged, deleted
        );
        Ok(())
    }

    async fn delete_orphaned_media(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;
        let deleted = self.media.delete_orphaned_media().await?;
        info!("[{}] deleted {} orphaned media items", ctx.job_id, deleted);
        Ok(())
    }

    async fn validate_data(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;
        let fighters = self.fighters.validate_fighter_records().await?;
        let events = self.events.validate_event_data().await?;
        let fights = self.fights.validate_fight_results().await?;

        if fighters + events + fights > 0 {
            warn!(
                "[{}] integrity issues: {} fighter records, {} events, {} fight results",
                ctx.job_id, fighters, events, fights
            );
        } else {
            info!("[{}] data integrity validated", ctx.job_id);
        }
        Ok(())
    }

    async fn archive_old_records(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days as i64);
        let flagged = self.fights.archive_old_fights(cutoff).await?;
        info!("[{}] flagged {} fights as archived", ctx.job_id, flagged);
        Ok(())
    }
}

#[async_trait]
impl BackgroundJob for CleanupJob {
    fn id(&self) -> &'static str {
        "cleanup"
    }

    fn name(&self) -> &'static str {
        "Cleanup"
    }

    fn description(&self) -> &'static str {
        "Remove expired media and duplicates, validate data integrity"
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;

        let mut group = FanOut::new(ctx);
        let job = self.clone();
        group.spawn("expired_media", move |ctx| async move {
            job.delete_expired_media(&ctx).await
        });
        let job = self.clone();
        group.spawn("duplicates", move |ctx| async move {
            job.remove_duplicates(&ctx).await
        });
        let job = self.clone();
        group.spawn("orphaned_media", move |ctx| async move {
            job.delete_orphaned_media(&ctx).await
        });
        let job = self.clone();
        group.spawn("validation", move |ctx| async move { job.validate_data(&ctx).await });
        let job = self.clone();
        group.spawn("old_records", move |ctx| async move {
            job.archive_old_records(&ctx).await
        });

        group.join().await?;
        info!("[{}] cleanup finished", ctx.job_id);
        Ok(())
    }
}
