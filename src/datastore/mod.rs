//! Data access used by the jobs.
//!
//! Each job depends only on the store traits it needs. [`SqliteDatastore`]
//! implements all of them over a single SQLite database.

mod models;
mod schema;
mod sqlite_datastore;

pub use models::*;
pub use schema::DATASTORE_VERSIONED_SCHEMAS;
pub use sqlite_datastore::{SqliteArchiveTransaction, SqliteDatastore};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait PromotionStore: Send + Sync {
    async fn get_active_promotions(&self) -> Result<Vec<Promotion>>;
}

#[async_trait]
pub trait FighterStore: Send + Sync {
    /// Active fighters of one promotion's weight class.
    async fn get_fighters_in_division(
        &self,
        promotion_id: &str,
        weight_class: &str,
    ) -> Result<Vec<Fighter>>;

    /// Fighters whose data was last refreshed before `stale_before`.
    async fn get_fighters_to_update(&self, stale_before: DateTime<Utc>) -> Result<Vec<Fighter>>;

    /// Apply scraped data and stamp the update time.
    async fn update_fighter(&self, fighter_id: &str, profile: &FighterProfile) -> Result<()>;

    /// Fighters sharing a name, oldest record kept.
    async fn get_duplicate_fighters(&self) -> Result<Vec<DuplicateGroup>>;

    /// Repoint fights and rankings of `duplicates` to `keep`, then delete them.
    async fn merge_fighters(&self, keep: &str, duplicates: &[String]) -> Result<()>;

    /// Count fighters with impossible records.
    async fn validate_fighter_records(&self) -> Result<usize>;
}

#[async_trait]
pub trait FightStore: Send + Sync {
    /// The fighter's last `limit` fights, newest first.
    async fn get_recent_fights(&self, fighter_id: &str, limit: usize) -> Result<Vec<Fight>>;

    /// Fights dated before `cutoff`, ordered by id.
    async fn get_old_fights(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Fight>>;

    /// Past fights that still have no result.
    async fn get_fights_without_results(&self, now: DateTime<Utc>) -> Result<Vec<Fight>>;

    async fn update_fight_result(&self, fight_id: &str, result: &FightResult) -> Result<()>;

    /// Flag finished fights dated before `cutoff` as archived.
    async fn archive_old_fights(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Count finished fights whose winner is not one of the two fighters.
    async fn validate_fight_results(&self) -> Result<usize>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_upcoming_events(&self, now: DateTime<Utc>) -> Result<Vec<Event>>;

    async fn update_event(&self, event_id: &str, details: &EventDetails) -> Result<()>;

    /// Events sharing name and date, oldest record kept.
    async fn get_duplicate_events(&self) -> Result<Vec<DuplicateGroup>>;

    async fn delete_event(&self, event_id: &str) -> Result<()>;

    /// Count events with missing names.
    async fn validate_event_data(&self) -> Result<usize>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Unarchived media created before `cutoff`, ordered by id.
    async fn get_media_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Media>>;

    async fn delete_media(&self, media_id: &str) -> Result<()>;

    /// Delete media attached to fights that exist neither live nor archived.
    async fn delete_orphaned_media(&self) -> Result<usize>;
}

#[async_trait]
pub trait RankingStore: Send + Sync {
    async fn get_active_weight_classes(&self, promotion_id: &str) -> Result<Vec<String>>;

    async fn get_current_rankings(
        &self,
        promotion_id: &str,
        weight_class: &str,
    ) -> Result<Vec<Ranking>>;

    /// Write a new ranking table for one weight class.
    ///
    /// Reads the previous table and writes the new one in a single write
    /// transaction. Rows already written by `run_id` keep their previous
    /// rank, so repeating the call for the same run is harmless. Fighters
    /// missing from `ranked` are removed from the table.
    async fn replace_rankings(
        &self,
        promotion_id: &str,
        weight_class: &str,
        ranked: &[RankedFighter],
        run_id: Uuid,
        effective_date: DateTime<Utc>,
    ) -> Result<Vec<Ranking>>;

    /// Rebuild the ranking summary read model.
    async fn refresh_ranking_views(&self) -> Result<()>;
}

/// One archive run's write transaction.
///
/// Statements may be issued from several tasks; implementations serialize
/// them. Dropping the transaction without committing rolls it back.
#[async_trait]
pub trait ArchiveTransaction: Send + Sync {
    async fn move_fight_to_history(&self, fight: &Fight) -> Result<()>;

    async fn mark_media_archived(&self, media_id: &str, storage_location: &str) -> Result<()>;

    /// Refresh per-year partition bookkeeping. Returns the number of partitions.
    async fn maintain_partitions(&self) -> Result<usize>;

    async fn commit(&self) -> Result<()>;
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn begin_archive(&self) -> Result<Arc<dyn ArchiveTransaction>>;

    /// Look for archived rows missing mandatory fields.
    async fn verify_archive(&self) -> Result<ArchiveViolations>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn fighter_stats(&self) -> Result<FighterStats>;

    async fn event_stats(&self, since: DateTime<Utc>) -> Result<EventStats>;

    async fn finish_stats(&self) -> Result<FinishStats>;

    async fn store_metric(
        &self,
        kind: MetricKind,
        data: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<()>;
}
