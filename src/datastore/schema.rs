//! SQLite schema definitions for the scheduler datastore.
//!
//! The database version is kept in `PRAGMA user_version`. A fresh database
//! is created at the latest version; older ones are migrated forward one
//! version at a time.

use anyhow::{bail, Result};
use rusqlite::{params, Connection};

pub struct VersionedSchema {
    pub version: usize,
    /// Batches that build this version from an empty database.
    pub create: &'static [&'static str],
    /// Upgrade from the previous version.
    pub migration: Option<fn(&Connection) -> Result<()>>,
    /// Tables that must exist at this version.
    pub tables: &'static [&'static str],
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for batch in self.create {
            conn.execute_batch(batch)?;
        }
        conn.execute(&format!("PRAGMA user_version = {}", self.version), [])?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Table {} is missing", table);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Version 1 - Core entities and rankings
// =============================================================================

const CORE_TABLES_V1: &str = "
CREATE TABLE promotions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE fighters (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    nickname TEXT,
    promotion_id TEXT,
    weight_class TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    age INTEGER,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    draws INTEGER NOT NULL DEFAULT 0,
    no_contests INTEGER NOT NULL DEFAULT 0,
    last_fight_date TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_fighters_division ON fighters(promotion_id, weight_class);
CREATE INDEX idx_fighters_name ON fighters(name);

CREATE TABLE events (
    id TEXT PRIMARY KEY,
    promotion_id TEXT,
    name TEXT NOT NULL,
    date TEXT NOT NULL,
    venue TEXT,
    attendance INTEGER,
    ppv_buys INTEGER,
    status TEXT NOT NULL DEFAULT 'scheduled',
    created_at TEXT NOT NULL
);
CREATE INDEX idx_events_date ON events(date);

CREATE TABLE fights (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    fighter1_id TEXT NOT NULL,
    fighter2_id TEXT NOT NULL,
    weight_class TEXT NOT NULL,
    fight_date TEXT NOT NULL,
    is_title_fight INTEGER NOT NULL DEFAULT 0,
    winner_id TEXT,
    method TEXT,
    round INTEGER,
    is_archived INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_fights_date ON fights(fight_date);
CREATE INDEX idx_fights_fighter1 ON fights(fighter1_id, fight_date DESC);
CREATE INDEX idx_fights_fighter2 ON fights(fighter2_id, fight_date DESC);

CREATE TABLE fight_media (
    id TEXT PRIMARY KEY,
    fight_id TEXT,
    media_type TEXT NOT NULL,
    url TEXT NOT NULL,
    storage_location TEXT,
    archive_location TEXT,
    is_archived INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_fight_media_created ON fight_media(created_at);

CREATE TABLE historical_fights (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    fighter1_id TEXT NOT NULL,
    fighter2_id TEXT NOT NULL,
    weight_class TEXT,
    fight_date TEXT,
    fight_details TEXT,
    archived_at TEXT NOT NULL
);

CREATE TABLE rankings (
    promotion_id TEXT NOT NULL,
    weight_class TEXT NOT NULL,
    fighter_id TEXT NOT NULL,
    rank INTEGER NOT NULL,
    previous_rank INTEGER,
    points REAL NOT NULL,
    effective_date TEXT NOT NULL,
    run_id TEXT NOT NULL,
    PRIMARY KEY (promotion_id, weight_class, fighter_id)
);
";

const TABLES_V1: &[&str] = &[
    "promotions",
    "fighters",
    "events",
    "fights",
    "fight_media",
    "historical_fights",
    "rankings",
];

// =============================================================================
// Version 2 - Derived data: partitions, ranking summary, metric snapshots
// =============================================================================

const DERIVED_TABLES_V2: &str = "
CREATE TABLE fight_partitions (
    year INTEGER PRIMARY KEY,
    fight_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE ranking_summary (
    promotion_id TEXT NOT NULL,
    weight_class TEXT NOT NULL,
    fighter_id TEXT NOT NULL,
    fighter_name TEXT NOT NULL,
    rank INTEGER NOT NULL,
    movement INTEGER,
    points REAL NOT NULL,
    effective_date TEXT NOT NULL,
    PRIMARY KEY (promotion_id, weight_class, fighter_id)
);

CREATE TABLE metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_metrics_type_created ON metrics(type, created_at DESC);
";

const TABLES_V2: &[&str] = &[
    "promotions",
    "fighters",
    "events",
    "fights",
    "fight_media",
    "historical_fights",
    "rankings",
    "fight_partitions",
    "ranking_summary",
    "metrics",
];

/// Migration from version 1 to version 2: add derived data tables
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(DERIVED_TABLES_V2)?;
    Ok(())
}

pub const DATASTORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        create: &[CORE_TABLES_V1],
        migration: None,
        tables: TABLES_V1,
    },
    VersionedSchema {
        version: 2,
        create: &[CORE_TABLES_V1, DERIVED_TABLES_V2],
        migration: Some(migrate_v1_to_v2),
        tables: TABLES_V2,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_sequential() {
        for (index, schema) in DATASTORE_VERSIONED_SCHEMAS.iter().enumerate() {
            assert_eq!(schema.version, index + 1);
        }
        assert!(DATASTORE_VERSIONED_SCHEMAS[0].migration.is_none());
    }

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let latest = DATASTORE_VERSIONED_SCHEMAS.last().unwrap();
        latest.create(&conn).unwrap();
        latest.validate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, latest.version);
    }

    #[test]
    fn test_migration_reaches_latest_tables() {
        let conn = Connection::open_in_memory().unwrap();
        DATASTORE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        assert!(DATASTORE_VERSIONED_SCHEMAS[1].validate(&conn).is_err());

        migrate_v1_to_v2(&conn).unwrap();
        DATASTORE_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }
}
