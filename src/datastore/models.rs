use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// =============================================================================
// Core entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FighterStatus {
    Active,
    Retired,
    Suspended,
}

impl FighterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FighterStatus::Active => "active",
            FighterStatus::Retired => "retired",
            FighterStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FighterStatus::Active),
            "retired" => Some(FighterStatus::Retired),
            "suspended" => Some(FighterStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FighterRecord {
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub no_contests: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fighter {
    pub id: String,
    pub name: String,
    pub nickname: Option<String>,
    pub promotion_id: Option<String>,
    pub weight_class: String,
    pub status: FighterStatus,
    pub age: Option<u32>,
    pub record: FighterRecord,
    pub last_fight_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fighter {
    pub fn new(id: impl Into<String>, name: impl Into<String>, weight_class: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            nickname: None,
            promotion_id: None,
            weight_class: weight_class.into(),
            status: FighterStatus::Active,
            age: None,
            record: FighterRecord::default(),
            last_fight_date: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FightResult {
    pub winner_id: Option<String>,
    /// e.g. "ko", "submission", "decision", "draw"
    pub method: String,
    pub round: Option<u32>,
}

impl FightResult {
    pub fn win(winner_id: impl Into<String>, method: impl Into<String>, round: Option<u32>) -> Self {
        Self {
            winner_id: Some(winner_id.into()),
            method: method.into(),
            round,
        }
    }

    pub fn draw() -> Self {
        Self {
            winner_id: None,
            method: METHOD_DRAW.to_string(),
            round: None,
        }
    }
}

pub const METHOD_DECISION: &str = "decision";
pub const METHOD_DRAW: &str = "draw";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fight {
    pub id: String,
    pub event_id: Option<String>,
    pub fighter1_id: String,
    pub fighter2_id: String,
    pub weight_class: String,
    pub fight_date: DateTime<Utc>,
    pub is_title_fight: bool,
    pub result: Option<FightResult>,
    pub is_archived: bool,
}

impl Fight {
    pub fn new(
        id: impl Into<String>,
        fighter1_id: impl Into<String>,
        fighter2_id: impl Into<String>,
        weight_class: impl Into<String>,
        fight_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            event_id: None,
            fighter1_id: fighter1_id.into(),
            fighter2_id: fighter2_id.into(),
            weight_class: weight_class.into(),
            fight_date,
            is_title_fight: false,
            result: None,
            is_archived: false,
        }
    }

    pub fn with_result(mut self, result: FightResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn title_fight(mut self) -> Self {
        self.is_title_fight = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(EventStatus::Scheduled),
            "completed" => Some(EventStatus::Completed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub promotion_id: Option<String>,
    pub name: String,
    pub date: DateTime<Utc>,
    pub venue: Option<String>,
    pub attendance: Option<i64>,
    pub ppv_buys: Option<i64>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: impl Into<String>, name: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            promotion_id: None,
            name: name.into(),
            date,
            venue: None,
            attendance: None,
            ppv_buys: None,
            status: EventStatus::Scheduled,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub fight_id: Option<String>,
    pub media_type: String,
    pub url: String,
    pub storage_location: Option<String>,
    pub archive_location: Option<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Media {
    pub fn new(
        id: impl Into<String>,
        fight_id: Option<String>,
        url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            fight_id,
            media_type: "video".to_string(),
            url: url.into(),
            storage_location: None,
            archive_location: None,
            is_archived: false,
            created_at,
        }
    }
}

// =============================================================================
// Rankings
// =============================================================================

/// A fighter's position within one (promotion, weight class) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub promotion_id: String,
    pub weight_class: String,
    pub fighter_id: String,
    pub rank: u32,
    /// Rank before the run that wrote this row, `None` for newcomers.
    pub previous_rank: Option<u32>,
    pub points: f64,
    pub effective_date: DateTime<Utc>,
    pub run_id: Uuid,
}

/// Scoring output, ordered best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFighter {
    pub fighter_id: String,
    pub points: f64,
}

// =============================================================================
// Scraped updates
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FighterProfile {
    pub name: String,
    pub nickname: Option<String>,
    pub weight_class: Option<String>,
    pub age: Option<u32>,
    pub status: Option<FighterStatus>,
    #[serde(default)]
    pub record: FighterRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    pub name: String,
    pub date: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub attendance: Option<i64>,
    pub ppv_buys: Option<i64>,
    pub status: Option<EventStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedFightResult {
    pub fighter1_id: String,
    pub fighter2_id: String,
    pub result: FightResult,
}

// =============================================================================
// Maintenance
// =============================================================================

/// Records considered the same entity. `keep` survives, `duplicates` go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub keep: String,
    pub duplicates: Vec<String>,
}

/// Rows that break the invariants archived data must satisfy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveViolations {
    pub incomplete_fights: usize,
    pub unlocated_media: usize,
}

impl ArchiveViolations {
    pub fn is_clean(&self) -> bool {
        self.incomplete_fights == 0 && self.unlocated_media == 0
    }
}

// =============================================================================
// Aggregated metrics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    FighterStats,
    EventStats,
    FinishStats,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::FighterStats => "fighter_stats",
            MetricKind::EventStats => "event_stats",
            MetricKind::FinishStats => "finish_stats",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FighterStats {
    pub total_active: i64,
    pub average_age: Option<f64>,
    pub weight_class_distribution: BTreeMap<String, i64>,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_draws: i64,
    pub total_no_contests: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total_events: i64,
    pub average_attendance: Option<f64>,
    pub average_ppv_buys: Option<f64>,
    pub venue_distribution: BTreeMap<String, i64>,
    pub title_fights: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinishStats {
    pub completed_fights: i64,
    pub method_distribution: BTreeMap<String, i64>,
    pub round_distribution: BTreeMap<u32, i64>,
}
