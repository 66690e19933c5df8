//! Test datastore creation and seeding helpers

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mma_scheduler::background_jobs::JobDefinition;
use mma_scheduler::datastore::{
    Fight, FightResult, Fighter, Media, Promotion, SqliteDatastore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(days)
}

/// Definitions for the given jobs with a short timeout and `max_retries` attempts.
pub fn job_definitions(names: &[&str], max_retries: u32) -> HashMap<String, JobDefinition> {
    names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                JobDefinition::new(*name, "@daily", Duration::from_secs(30), max_retries),
            )
        })
        .collect()
}

pub struct TestDatastore {
    pub store: Arc<SqliteDatastore>,
    db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestDatastore {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("mma.db");
        let store = SqliteDatastore::new(&db_path).expect("Failed to create test datastore");
        Self {
            store: Arc::new(store),
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// A second datastore on the same file, with its own connection.
    pub fn open_another(&self) -> Arc<SqliteDatastore> {
        Arc::new(SqliteDatastore::new(&self.db_path).expect("Failed to reopen test datastore"))
    }

    pub fn add_promotion(&self, id: &str, name: &str) {
        self.store
            .insert_promotion(&Promotion {
                id: id.to_string(),
                name: name.to_string(),
                active: true,
            })
            .expect("Failed to insert promotion");
    }

    /// Active fighter who last fought a month ago.
    pub fn add_fighter(&self, id: &str, promotion_id: &str, weight_class: &str) {
        let mut fighter = Fighter::new(id, format!("Fighter {}", id), weight_class);
        fighter.promotion_id = Some(promotion_id.to_string());
        fighter.last_fight_date = Some(days_ago(30));
        self.store
            .insert_fighter(&fighter)
            .expect("Failed to insert fighter");
    }

    /// Finished fight won by `winner`.
    pub fn add_fight(
        &self,
        id: &str,
        winner: &str,
        loser: &str,
        weight_class: &str,
        method: &str,
        days_ago_count: i64,
    ) {
        let fight = Fight::new(id, winner, loser, weight_class, days_ago(days_ago_count))
            .with_result(FightResult::win(winner, method, Some(1)));
        self.store.insert_fight(&fight).expect("Failed to insert fight");
    }

    pub fn add_title_fight(
        &self,
        id: &str,
        winner: &str,
        loser: &str,
        weight_class: &str,
        method: &str,
        days_ago_count: i64,
    ) {
        let fight = Fight::new(id, winner, loser, weight_class, days_ago(days_ago_count))
            .title_fight()
            .with_result(FightResult::win(winner, method, Some(1)));
        self.store.insert_fight(&fight).expect("Failed to insert fight");
    }

    pub fn add_media(&self, id: &str, fight_id: &str, days_ago_count: i64) {
        let media = Media::new(
            id,
            Some(fight_id.to_string()),
            format!("https://media.example/{}.mp4", id),
            days_ago(days_ago_count),
        );
        self.store.insert_media(&media).expect("Failed to insert media");
    }

    pub fn insert_raw_media(&self, media: &Media) {
        self.store.insert_media(media).expect("Failed to insert media");
    }
}
