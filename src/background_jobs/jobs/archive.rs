//! Archive background job.
//!
//! Moves old fights into historical storage and archives their media inside
//! a single write transaction. Three subtasks share the transaction: fights,
//! media and partition bookkeeping. The transaction is committed only when
//! all three succeed, then the archived data is verified.

use crate::background_jobs::{BackgroundJob, FanOut, JobContext, JobError};
use crate::datastore::{ArchiveStore, ArchiveTransaction, FightStore, Media, MediaStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long cancelled subtasks get to finish their current statement
/// before they are aborted.
const SUBTASK_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Fights and media older than this are archived.
    pub archive_age_days: u32,
    pub batch_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_age_days: 365,
            batch_size: 100,
        }
    }
}

/// Storage side of media archival.
#[async_trait]
pub trait MediaArchiver: Send + Sync {
    async fn compress(&self, media: &Media) -> Result<()>;

    /// Move the media to archive storage and return its new location.
    async fn move_to_archive(&self, media: &Media) -> Result<String>;
}

/// Leaves files where they are and only records a location.
pub struct NoOpMediaArchiver;

#[async_trait]
impl MediaArchiver for NoOpMediaArchiver {
    async fn compress(&self, _media: &Media) -> Result<()> {
        Ok(())
    }

    async fn move_to_archive(&self, media: &Media) -> Result<String> {
        Ok(media
            .archive_location
            .clone()
            .unwrap_or_else(|| format!("archive/{}", media.id)))
    }
}

#[derive(Clone)]
pub struct ArchiveJob {
    fights: Arc<dyn FightStore>,
    media: Arc<dyn MediaStore>,
    archive: Arc<dyn ArchiveStore>,
    archiver: Arc<dyn MediaArchiver>,
    config: ArchiveConfig,
}

impl ArchiveJob {
    pub fn new<S>(store: Arc<S>, archiver: Arc<dyn MediaArchiver>, config: ArchiveConfig) -> Self
    where
        S: FightStore + MediaStore + ArchiveStore + 'static,
    {
        Self {
            fights: store.clone(),
            media: store.clone(),
            archive: store,
            archiver,
            config,
        }
    }

    async fn archive_fights(
        &self,
        ctx: &JobContext,
        tx: &dyn ArchiveTransaction,
        cutoff: DateTime<Utc>,
    ) -> Result<(), JobError> {
        // Moves are not visible to the reading connection until commit, so
        // the offset walks a stable snapshot.
        let mut offset = 0;
        let mut moved = 0;
        let mut failed = 0;
        loop {
            ctx.check()?;
            let batch = self
                .fights
                .get_old_fights(cutoff, self.config.batch_size, offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            for fight in &batch {
                // A failed move only rolls back its own savepoint
                match tx.move_fight_to_history(fight).await {
                    Ok(()) => moved += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            "[{}] failed to archive fight {}: {:#}",
                            ctx.job_id, fight.id, e
                        );
                    }
                }
            }
            offset += batch.len();
            debug!("[{}] moved {} fights so far", ctx.job_id, moved);
        }

        info!(
            "[{}] moved {} fights to history ({} failed)",
            ctx.job_id, moved, failed
        );
        Ok(())
    }

    async fn archive_media(
        &self,
        ctx: &JobContext,
        tx: &dyn ArchiveTransaction,
        cutoff: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let mut offset = 0;
        let mut archived = 0;
        let mut failed = 0;
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
                ctx.check()?;
                match self.archive_one(tx, media).await {
                    Ok(()) => archived += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            "[{}] failed to archive media {}: {:#}",
                            ctx.job_id, media.id, e
                        );
                    }
                }
            }
            offset += batch.len();
        }

        info!(
            "[{}] archived {} media items ({} failed)",
            ctx.job_id, archived, failed
        );
        Ok(())
    }

    async fn archive_one(&self, tx: &dyn ArchiveTransaction, media: &Media) -> Result<()> {
        self.archiver.compress(media).await?;
        let location = self.archiver.move_to_archive(media).await?;
        tx.mark_media_archived(&media.id, &location).await
    }
}

async fn maintain_partitions(
    ctx: &JobContext,
    tx: &dyn ArchiveTransaction,
) -> Result<(), JobError> {
    ctx.check()?;
    let partitions = tx.maintain_partitions().await?;
    debug!("[{}] {} fight partitions maintained", ctx.job_id, partitions);
    Ok(())
}

#[async_trait]
impl BackgroundJob for ArchiveJob {
    fn id(&self) -> &'static str {
        "archive"
    }

    fn name(&self) -> &'static str {
        "Archive"
    }

    fn description(&self) -> &'static str {
        "Move old fights and media into archive storage"
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;

        let cutoff = Utc::now() - ChronoDuration::days(self.config.archive_age_days as i64);
        info!("[{}] archiving data older than {}", ctx.job_id, cutoff);

        let tx = self.archive.begin_archive().await?;

        let mut group = FanOut::new(ctx).with_grace(SUBTASK_GRACE);
        {
            let job = self.clone();
            let tx = Arc::clone(&tx);
            group.spawn("archive_fights", move |ctx| async move {
                job.archive_fights(&ctx, tx.as_ref(), cutoff).await
            });
        }
        {
            let job = self.clone();
            let tx = Arc::clone(&tx);
            group.spawn("archive_media", move |ctx| async move {
                job.archive_media(&ctx, tx.as_ref(), cutoff).await
            });
        }
        {
            let tx = Arc::clone(&tx);
            group.spawn("maintain_partitions", move |ctx| async move {
                maintain_partitions(&ctx, tx.as_ref()).await
            });
        }

        // Dropping the last handle on failure rolls the transaction back.
        group.join().await?;
        tx.commit().await?;
        info!("[{}] archive transaction committed", ctx.job_id);

        let violations = self.archive.verify_archive().await?;
        if !violations.is_clean() {
            return Err(JobError::Verification(format!(
                "{} historical fights missing data, {} archived media without storage location",
                violations.incomplete_fights, violations.unlocated_media
            )));
        }
        Ok(())
    }
}
