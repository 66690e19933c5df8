use super::models::*;
use super::schema::DATASTORE_VERSIONED_SCHEMAS;
use super::{
    ArchiveStore, ArchiveTransaction, EventStore, FightStore, FighterStore, MediaStore,
    PromotionStore, RankingStore, StatsStore,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const FIGHTER_COLUMNS: &str = "id, name, nickname, promotion_id, weight_class, status, age, \
     wins, losses, draws, no_contests, last_fight_date, created_at, updated_at";
const FIGHT_COLUMNS: &str = "id, event_id, fighter1_id, fighter2_id, weight_class, fight_date, \
     is_title_fight, winner_id, method, round, is_archived";
const EVENT_COLUMNS: &str =
    "id, promotion_id, name, date, venue, attendance, ppv_buys, status, created_at";
const MEDIA_COLUMNS: &str =
    "id, fight_id, media_type, url, storage_location, archive_location, is_archived, created_at";
const RANKING_COLUMNS: &str =
    "promotion_id, weight_class, fighter_id, rank, previous_rank, points, effective_date, run_id";

/// SQLite implementation of every store trait.
///
/// Calls from async code run on the blocking pool against one shared
/// connection. Archive runs get a dedicated connection of their own.
pub struct SqliteDatastore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteDatastore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = open_connection(path).context("Failed to open datastore database")?;
        let latest = DATASTORE_VERSIONED_SCHEMAS
            .last()
            .context("No datastore schema defined")?;

        if is_new_db {
            info!("Creating new datastore database at {:?}", path);
            latest.create(&conn)?;
        } else {
            let db_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            if db_version < 1 {
                bail!(
                    "Datastore database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let version_index = DATASTORE_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version as i64 == db_version)
                .with_context(|| format!("Unknown datastore database version {}", db_version))?;
            DATASTORE_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Datastore schema validation failed for version {}",
                        db_version
                    )
                })?;

            if (db_version as usize) < latest.version {
                info!(
                    "Migrating datastore database from version {} to {}",
                    db_version, latest.version
                );
                Self::migrate_if_needed(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in DATASTORE_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            info!(
                "Running datastore migration from version {} to {}",
                latest_from, schema.version
            );
            if let Some(migration_fn) = schema.migration {
                migration_fn(&tx).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
            latest_from = schema.version;
        }
        tx.execute(&format!("PRAGMA user_version = {}", latest_from), [])?;
        tx.commit()?;
        Ok(())
    }

    /// Run `f` against the shared connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .context("Datastore task failed")?
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Direct access, used for seeding and inspection
    // -------------------------------------------------------------------------

    pub fn insert_promotion(&self, promotion: &Promotion) -> Result<()> {
        self.lock().execute(
            "INSERT INTO promotions (id, name, active) VALUES (?1, ?2, ?3)",
            params![promotion.id, promotion.name, promotion.active],
        )?;
        Ok(())
    }

    pub fn insert_fighter(&self, fighter: &Fighter) -> Result<()> {
        self.lock().execute(
            &format!(
                "INSERT INTO fighters ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                FIGHTER_COLUMNS
            ),
            params![
                fighter.id,
                fighter.name,
                fighter.nickname,
                fighter.promotion_id,
                fighter.weight_class,
                fighter.status.as_str(),
                fighter.age,
                fighter.record.wins,
                fighter.record.losses,
                fighter.record.draws,
                fighter.record.no_contests,
                fighter.last_fight_date.as_ref().map(format_datetime),
                format_datetime(&fighter.created_at),
                format_datetime(&fighter.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        self.lock().execute(
            &format!(
                "INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                EVENT_COLUMNS
            ),
            params![
                event.id,
                event.promotion_id,
                event.name,
                format_datetime(&event.date),
                event.venue,
                event.attendance,
                event.ppv_buys,
                event.status.as_str(),
                format_datetime(&event.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_fight(&self, fight: &Fight) -> Result<()> {
        let result = fight.result.as_ref();
        self.lock().execute(
            &format!(
                "INSERT INTO fights ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                FIGHT_COLUMNS
            ),
            params![
                fight.id,
                fight.event_id,
                fight.fighter1_id,
                fight.fighter2_id,
                fight.weight_class,
                format_datetime(&fight.fight_date),
                fight.is_title_fight,
                result.and_then(|r| r.winner_id.clone()),
                result.map(|r| r.method.clone()),
                result.and_then(|r| r.round),
                fight.is_archived,
            ],
        )?;
        Ok(())
    }

    pub fn insert_media(&self, media: &Media) -> Result<()> {
        self.lock().execute(
            &format!(
                "INSERT INTO fight_media ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                MEDIA_COLUMNS
            ),
            params![
                media.id,
                media.fight_id,
                media.media_type,
                media.url,
                media.storage_location,
                media.archive_location,
                media.is_archived,
                format_datetime(&media.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_fighter(&self, fighter_id: &str) -> Result<Option<Fighter>> {
        let conn = self.lock();
        let fighter = conn
            .query_row(
                &format!("SELECT {} FROM fighters WHERE id = ?1", FIGHTER_COLUMNS),
                params![fighter_id],
                row_to_fighter,
            )
            .optional()?;
        Ok(fighter)
    }

    pub fn get_fight(&self, fight_id: &str) -> Result<Option<Fight>> {
        let conn = self.lock();
        let fight = conn
            .query_row(
                &format!("SELECT {} FROM fights WHERE id = ?1", FIGHT_COLUMNS),
                params![fight_id],
                row_to_fight,
            )
            .optional()?;
        Ok(fight)
    }

    pub fn get_media(&self, media_id: &str) -> Result<Option<Media>> {
        let conn = self.lock();
        let media = conn
            .query_row(
                &format!("SELECT {} FROM fight_media WHERE id = ?1", MEDIA_COLUMNS),
                params![media_id],
                row_to_media,
            )
            .optional()?;
        Ok(media)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.lock();
        let event = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![event_id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Number of rows in one of the datastore tables.
    pub fn table_row_count(&self, table: &str) -> Result<usize> {
        let known = DATASTORE_VERSIONED_SCHEMAS
            .last()
            .map(|s| s.tables.contains(&table))
            .unwrap_or(false);
        if !known {
            bail!("Unknown table {}", table);
        }
        let count: i64 =
            self.lock()
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    /// Most recent stored snapshot of a metric.
    pub fn latest_metric(&self, kind: MetricKind) -> Result<Option<serde_json::Value>> {
        let data: Option<String> = self
            .lock()
            .query_row(
                "SELECT data FROM metrics WHERE type = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Invalid metric payload"))
            .transpose()
    }

    /// Ranking summary rows as (fighter_id, fighter_name, rank, movement).
    pub fn ranking_summary(
        &self,
        promotion_id: &str,
        weight_class: &str,
    ) -> Result<Vec<(String, String, u32, Option<i64>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT fighter_id, fighter_name, rank, movement FROM ranking_summary
             WHERE promotion_id = ?1 AND weight_class = ?2 ORDER BY rank",
        )?;
        let rows = stmt
            .query_map(params![promotion_id, weight_class], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_optional_datetime(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_datetime).transpose()
}

fn row_to_fighter(row: &rusqlite::Row) -> rusqlite::Result<Fighter> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Fighter {
        id: row.get("id")?,
        name: row.get("name")?,
        nickname: row.get("nickname")?,
        promotion_id: row.get("promotion_id")?,
        weight_class: row.get("weight_class")?,
        status: FighterStatus::parse(&status).unwrap_or(FighterStatus::Active),
        age: row.get("age")?,
        record: FighterRecord {
            wins: row.get("wins")?,
            losses: row.get("losses")?,
            draws: row.get("draws")?,
            no_contests: row.get("no_contests")?,
        },
        last_fight_date: parse_optional_datetime(row.get("last_fight_date")?)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_fight(row: &rusqlite::Row) -> rusqlite::Result<Fight> {
    let fight_date: String = row.get("fight_date")?;
    let method: Option<String> = row.get("method")?;
    let result = match method {
        Some(method) => Some(FightResult {
            winner_id: row.get("winner_id")?,
            method,
            round: row.get("round")?,
        }),
        None => None,
    };
    Ok(Fight {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        fighter1_id: row.get("fighter1_id")?,
        fighter2_id: row.get("fighter2_id")?,
        weight_class: row.get("weight_class")?,
        fight_date: parse_datetime(&fight_date)?,
        is_title_fight: row.get("is_title_fight")?,
        result,
        is_archived: row.get("is_archived")?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let date: String = row.get("date")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(Event {
        id: row.get("id")?,
        promotion_id: row.get("promotion_id")?,
        name: row.get("name")?,
        date: parse_datetime(&date)?,
        venue: row.get("venue")?,
        attendance: row.get("attendance")?,
        ppv_buys: row.get("ppv_buys")?,
        status: EventStatus::parse(&status).unwrap_or(EventStatus::Scheduled),
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_media(row: &rusqlite::Row) -> rusqlite::Result<Media> {
    let created_at: String = row.get("created_at")?;
    Ok(Media {
        id: row.get("id")?,
        fight_id: row.get("fight_id")?,
        media_type: row.get("media_type")?,
        url: row.get("url")?,
        storage_location: row.get("storage_location")?,
        archive_location: row.get("archive_location")?,
        is_archived: row.get("is_archived")?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn row_to_ranking(row: &rusqlite::Row) -> rusqlite::Result<Ranking> {
    let effective_date: String = row.get("effective_date")?;
    let run_id: String = row.get("run_id")?;
    Ok(Ranking {
        promotion_id: row.get("promotion_id")?,
        weight_class: row.get("weight_class")?,
        fighter_id: row.get("fighter_id")?,
        rank: row.get("rank")?,
        previous_rank: row.get("previous_rank")?,
        points: row.get("points")?,
        effective_date: parse_datetime(&effective_date)?,
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
    })
}

fn query_rankings(conn: &Connection, promotion_id: &str, weight_class: &str) -> Result<Vec<Ranking>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rankings WHERE promotion_id = ?1 AND weight_class = ?2 ORDER BY rank",
        RANKING_COLUMNS
    ))?;
    let rankings = stmt
        .query_map(params![promotion_id, weight_class], row_to_ranking)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rankings)
}

/// Group `(key, id)` rows that arrive sorted by key then age.
fn group_duplicates(rows: Vec<(String, String)>) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut current_key: Option<String> = None;
    for (key, id) in rows {
        match (&current_key, groups.last_mut()) {
            (Some(k), Some(group)) if *k == key => group.duplicates.push(id),
            _ => {
                current_key = Some(key);
                groups.push(DuplicateGroup {
                    keep: id,
                    duplicates: Vec::new(),
                });
            }
        }
    }
    groups.retain(|g| !g.duplicates.is_empty());
    groups
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count as usize)
}

fn distribution<K: rusqlite::types::FromSql + Ord>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<BTreeMap<K, i64>> {
    let mut stmt = conn.prepare(sql)?;
    let map = stmt
        .query_map(params, |row| Ok((row.get::<_, K>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(map)
}

#[async_trait]
impl PromotionStore for SqliteDatastore {
    async fn get_active_promotions(&self) -> Result<Vec<Promotion>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, active FROM promotions WHERE active = 1 ORDER BY id")?;
            let promotions = stmt
                .query_map([], |row| {
                    Ok(Promotion {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(promotions)
        })
        .await
    }
}

#[async_trait]
impl FighterStore for SqliteDatastore {
    async fn get_fighters_in_division(
        &self,
        promotion_id: &str,
        weight_class: &str,
    ) -> Result<Vec<Fighter>> {
        let promotion_id = promotion_id.to_string();
        let weight_class = weight_class.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fighters
                 WHERE promotion_id = ?1 AND weight_class = ?2 AND status = 'active'
                 ORDER BY id",
                FIGHTER_COLUMNS
            ))?;
            let fighters = stmt
                .query_map(params![promotion_id, weight_class], row_to_fighter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(fighters)
        })
        .await
    }

    async fn get_fighters_to_update(&self, stale_before: DateTime<Utc>) -> Result<Vec<Fighter>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fighters
                 WHERE status = 'active' AND updated_at < ?1
                 ORDER BY updated_at, id",
                FIGHTER_COLUMNS
            ))?;
            let fighters = stmt
                .query_map(params![format_datetime(&stale_before)], row_to_fighter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(fighters)
        })
        .await
    }

    async fn update_fighter(&self, fighter_id: &str, profile: &FighterProfile) -> Result<()> {
        let fighter_id = fighter_id.to_string();
        let profile = profile.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE fighters SET
                    name = ?2,
                    nickname = COALESCE(?3, nickname),
                    weight_class = COALESCE(?4, weight_class),
                    age = COALESCE(?5, age),
                    status = COALESCE(?6, status),
                    wins = ?7,
                    losses = ?8,
                    draws = ?9,
                    no_contests = ?10,
                    updated_at = ?11
                 WHERE id = ?1",
                params![
                    fighter_id,
                    profile.name,
                    profile.nickname,
                    profile.weight_class,
                    profile.age,
                    profile.status.map(|s| s.as_str()),
                    profile.record.wins,
                    profile.record.losses,
                    profile.record.draws,
                    profile.record.no_contests,
                    format_datetime(&Utc::now()),
                ],
            )?;
            if updated == 0 {
                bail!("Fighter {} not found", fighter_id);
            }
            Ok(())
        })
        .await
    }

    async fn get_duplicate_fighters(&self) -> Result<Vec<DuplicateGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, id FROM fighters
                 WHERE name IN (SELECT name FROM fighters GROUP BY name HAVING COUNT(*) > 1)
                 ORDER BY name, created_at, id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            Ok(group_duplicates(rows))
        })
        .await
    }

    async fn merge_fighters(&self, keep: &str, duplicates: &[String]) -> Result<()> {
        let keep = keep.to_string();
        let duplicates = duplicates.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for duplicate in &duplicates {
                tx.execute(
                    "UPDATE fights SET fighter1_id = ?1 WHERE fighter1_id = ?2",
                    params![keep, duplicate],
                )?;
                tx.execute(
                    "UPDATE fights SET fighter2_id = ?1 WHERE fighter2_id = ?2",
                    params![keep, duplicate],
                )?;
                tx.execute(
                    "UPDATE fights SET winner_id = ?1 WHERE winner_id = ?2",
                    params![keep, duplicate],
                )?;
                tx.execute(
                    "DELETE FROM rankings WHERE fighter_id = ?1",
                    params![duplicate],
                )?;
                tx.execute("DELETE FROM fighters WHERE id = ?1", params![duplicate])?;
            }
            tx.commit()?;
            debug!("Merged {} duplicates into fighter {}", duplicates.len(), keep);
            Ok(())
        })
        .await
    }

    async fn validate_fighter_records(&self) -> Result<usize> {
        self.with_conn(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM fighters
                 WHERE wins < 0 OR losses < 0 OR draws < 0 OR no_contests < 0
                    OR TRIM(name) = ''",
            )
        })
        .await
    }
}

#[async_trait]
impl FightStore for SqliteDatastore {
    async fn get_recent_fights(&self, fighter_id: &str, limit: usize) -> Result<Vec<Fight>> {
        let fighter_id = fighter_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fights
                 WHERE (fighter1_id = ?1 OR fighter2_id = ?1) AND method IS NOT NULL
                 ORDER BY fight_date DESC
                 LIMIT ?2",
                FIGHT_COLUMNS
            ))?;
            let fights = stmt
                .query_map(params![fighter_id, limit as i64], row_to_fight)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(fights)
        })
        .await
    }

    async fn get_old_fights(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Fight>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fights WHERE fight_date < ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                FIGHT_COLUMNS
            ))?;
            let fights = stmt
                .query_map(
                    params![format_datetime(&cutoff), limit as i64, offset as i64],
                    row_to_fight,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(fights)
        })
        .await
    }

    async fn get_fights_without_results(&self, now: DateTime<Utc>) -> Result<Vec<Fight>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fights
                 WHERE method IS NULL AND is_archived = 0 AND fight_date <= ?1
                 ORDER BY fight_date",
                FIGHT_COLUMNS
            ))?;
            let fights = stmt
                .query_map(params![format_datetime(&now)], row_to_fight)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(fights)
        })
        .await
    }

    async fn update_fight_result(&self, fight_id: &str, result: &FightResult) -> Result<()> {
        let fight_id = fight_id.to_string();
        let result = result.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let fight = tx
                .query_row(
                    &format!("SELECT {} FROM fights WHERE id = ?1", FIGHT_COLUMNS),
                    params![fight_id],
                    row_to_fight,
                )
                .optional()?
                .with_context(|| format!("Fight {} not found", fight_id))?;

            tx.execute(
                "UPDATE fights SET winner_id = ?2, method = ?3, round = ?4 WHERE id = ?1",
                params![fight_id, result.winner_id, result.method, result.round],
            )?;
            let fight_date = format_datetime(&fight.fight_date);
            tx.execute(
                "UPDATE fighters SET last_fight_date = ?1
                 WHERE id IN (?2, ?3) AND (last_fight_date IS NULL OR last_fight_date < ?1)",
                params![fight_date, fight.fighter1_id, fight.fighter2_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn archive_old_fights(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE fights SET is_archived = 1
                 WHERE fight_date < ?1 AND method IS NOT NULL AND is_archived = 0",
                params![format_datetime(&cutoff)],
            )?;
            Ok(updated)
        })
        .await
    }

    async fn validate_fight_results(&self) -> Result<usize> {
        self.with_conn(|conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM fights
                 WHERE fighter1_id = fighter2_id
                    OR (winner_id IS NOT NULL AND winner_id NOT IN (fighter1_id, fighter2_id))",
            )
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteDatastore {
    async fn get_upcoming_events(&self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM events WHERE date >= ?1 AND status = 'scheduled' ORDER BY date",
                EVENT_COLUMNS
            ))?;
            let events = stmt
                .query_map(params![format_datetime(&now)], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
        .await
    }

    async fn update_event(&self, event_id: &str, details: &EventDetails) -> Result<()> {
        let event_id = event_id.to_string();
        let details = details.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE events SET
                    name = ?2,
                    date = COALESCE(?3, date),
                    venue = COALESCE(?4, venue),
                    attendance = COALESCE(?5, attendance),
                    ppv_buys = COALESCE(?6, ppv_buys),
                    status = COALESCE(?7, status)
                 WHERE id = ?1",
                params![
                    event_id,
                    details.name,
                    details.date.as_ref().map(format_datetime),
                    details.venue,
                    details.attendance,
                    details.ppv_buys,
                    details.status.map(|s| s.as_str()),
                ],
            )?;
            if updated == 0 {
                bail!("Event {} not found", event_id);
            }
            Ok(())
        })
        .await
    }

    async fn get_duplicate_events(&self) -> Result<Vec<DuplicateGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name || '@' || date, id FROM events
                 WHERE (name, date) IN (
                     SELECT name, date FROM events GROUP BY name, date HAVING COUNT(*) > 1
                 )
                 ORDER BY name, date, created_at, id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            Ok(group_duplicates(rows))
        })
        .await
    }

    async fn delete_event(&self, event_id: &str) -> Result<()> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM events WHERE id = ?1", params![event_id])?;
            if deleted == 0 {
                bail!("Event {} not found", event_id);
            }
            Ok(())
        })
        .await
    }

    async fn validate_event_data(&self) -> Result<usize> {
        self.with_conn(|conn| count(conn, "SELECT COUNT(*) FROM events WHERE TRIM(name) = ''"))
            .await
    }
}

#[async_trait]
impl MediaStore for SqliteDatastore {
    async fn get_media_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Media>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fight_media
                 WHERE created_at < ?1 AND is_archived = 0
                 ORDER BY id LIMIT ?2 OFFSET ?3",
                MEDIA_COLUMNS
            ))?;
            let media = stmt
                .query_map(
                    params![format_datetime(&cutoff), limit as i64, offset as i64],
                    row_to_media,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(media)
        })
        .await
    }

    async fn delete_media(&self, media_id: &str) -> Result<()> {
        let media_id = media_id.to_string();
        self.with_conn(move |conn| {
            let deleted =
                conn.execute("DELETE FROM fight_media WHERE id = ?1", params![media_id])?;
            if deleted == 0 {
                bail!("Media {} not found", media_id);
            }
            Ok(())
        })
        .await
    }

    async fn delete_orphaned_media(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM fight_media
                 WHERE fight_id IS NOT NULL
                   AND fight_id NOT IN (SELECT id FROM fights)
                   AND fight_id NOT IN (SELECT id FROM historical_fights)",
                [],
            )?;
            Ok(deleted)
        })
        .await
    }
}

#[async_trait]
impl RankingStore for SqliteDatastore {
    async fn get_active_weight_classes(&self, promotion_id: &str) -> Result<Vec<String>> {
        let promotion_id = promotion_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT weight_class FROM fighters
                 WHERE promotion_id = ?1 AND status = 'active'
                 ORDER BY weight_class",
            )?;
            let classes = stmt
                .query_map(params![promotion_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(classes)
        })
        .await
    }

    async fn get_current_rankings(
        &self,
        promotion_id: &str,
        weight_class: &str,
    ) -> Result<Vec<Ranking>> {
        let promotion_id = promotion_id.to_string();
        let weight_class = weight_class.to_string();
        self.with_conn(move |conn| query_rankings(conn, &promotion_id, &weight_class))
            .await
    }

    async fn replace_rankings(
        &self,
        promotion_id: &str,
        weight_class: &str,
        ranked: &[RankedFighter],
        run_id: Uuid,
        effective_date: DateTime<Utc>,
    ) -> Result<Vec<Ranking>> {
        let promotion_id = promotion_id.to_string();
        let weight_class = weight_class.to_string();
        let ranked = ranked.to_vec();
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock before the read, so no other
            // writer can slip in between reading previous ranks and writing.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: HashMap<String, Ranking> =
                query_rankings(&tx, &promotion_id, &weight_class)?
                    .into_iter()
                    .map(|r| (r.fighter_id.clone(), r))
                    .collect();

            let run_id_str = run_id.to_string();
            let effective = format_datetime(&effective_date);
            for (position, fighter) in ranked.iter().enumerate() {
                let previous_rank = existing.get(&fighter.fighter_id).and_then(|row| {
                    if row.run_id == run_id {
                        row.previous_rank
                    } else {
                        Some(row.rank)
                    }
                });
                tx.execute(
                    "INSERT INTO rankings (promotion_id, weight_class, fighter_id, rank,
                                           previous_rank, points, effective_date, run_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(promotion_id, weight_class, fighter_id) DO UPDATE SET
                        rank = excluded.rank,
                        previous_rank = excluded.previous_rank,
                        points = excluded.points,
                        effective_date = excluded.effective_date,
                        run_id = excluded.run_id",
                    params![
                        promotion_id,
                        weight_class,
                        fighter.fighter_id,
                        (position + 1) as i64,
                        previous_rank,
                        fighter.points,
                        effective,
                        run_id_str,
                    ],
                )?;
            }

            let removed = tx.execute(
                "DELETE FROM rankings WHERE promotion_id = ?1 AND weight_class = ?2 AND run_id != ?3",
                params![promotion_id, weight_class, run_id_str],
            )?;
            if removed > 0 {
                debug!(
                    "Removed {} stale rankings from {} {}",
                    removed, promotion_id, weight_class
                );
            }

            let written = query_rankings(&tx, &promotion_id, &weight_class)?;
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn refresh_ranking_views(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM ranking_summary", [])?;
            tx.execute(
                "INSERT INTO ranking_summary (promotion_id, weight_class, fighter_id, fighter_name,
                                              rank, movement, points, effective_date)
                 SELECT r.promotion_id, r.weight_class, r.fighter_id, f.name, r.rank,
                        r.previous_rank - r.rank, r.points, r.effective_date
                 FROM rankings r
                 JOIN fighters f ON f.id = r.fighter_id",
                [],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ArchiveStore for SqliteDatastore {
    async fn begin_archive(&self) -> Result<Arc<dyn ArchiveTransaction>> {
        let path = self.path.clone();
        let tx = tokio::task::spawn_blocking(move || SqliteArchiveTransaction::begin(&path))
            .await
            .context("Datastore task failed")??;
        Ok(Arc::new(tx))
    }

    async fn verify_archive(&self) -> Result<ArchiveViolations> {
        self.with_conn(|conn| {
            let incomplete_fights = count(
                conn,
                "SELECT COUNT(*) FROM historical_fights
                 WHERE fight_date IS NULL OR fight_details IS NULL",
            )?;
            let unlocated_media = count(
                conn,
                "SELECT COUNT(*) FROM fight_media
                 WHERE is_archived = 1 AND storage_location IS NULL",
            )?;
            Ok(ArchiveViolations {
                incomplete_fights,
                unlocated_media,
            })
        })
        .await
    }
}

#[async_trait]
impl StatsStore for SqliteDatastore {
    async fn fighter_stats(&self) -> Result<FighterStats> {
        self.with_conn(|conn| {
            let mut stats = conn.query_row(
                "SELECT COUNT(*), AVG(age),
                        COALESCE(SUM(wins), 0), COALESCE(SUM(losses), 0),
                        COALESCE(SUM(draws), 0), COALESCE(SUM(no_contests), 0)
                 FROM fighters WHERE status = 'active'",
                [],
                |row| {
                    Ok(FighterStats {
                        total_active: row.get(0)?,
                        average_age: row.get(1)?,
                        weight_class_distribution: BTreeMap::new(),
                        total_wins: row.get(2)?,
                        total_losses: row.get(3)?,
                        total_draws: row.get(4)?,
                        total_no_contests: row.get(5)?,
                    })
                },
            )?;
            stats.weight_class_distribution = distribution(
                conn,
                "SELECT weight_class, COUNT(*) FROM fighters
                 WHERE status = 'active' GROUP BY weight_class",
                [],
            )?;
            Ok(stats)
        })
        .await
    }

    async fn event_stats(&self, since: DateTime<Utc>) -> Result<EventStats> {
        self.with_conn(move |conn| {
            let since = format_datetime(&since);
            let mut stats = conn.query_row(
                "SELECT COUNT(*), AVG(attendance), AVG(ppv_buys) FROM events WHERE date >= ?1",
                params![since],
                |row| {
                    Ok(EventStats {
                        total_events: row.get(0)?,
                        average_attendance: row.get(1)?,
                        average_ppv_buys: row.get(2)?,
                        ..Default::default()
                    })
                },
            )?;
            stats.venue_distribution = distribution(
                conn,
                "SELECT venue, COUNT(*) FROM events
                 WHERE date >= ?1 AND venue IS NOT NULL GROUP BY venue",
                params![since],
            )?;
            stats.title_fights = conn.query_row(
                "SELECT COUNT(*) FROM fights f JOIN events e ON e.id = f.event_id
                 WHERE e.date >= ?1 AND f.is_title_fight = 1",
                params![since],
                |row| row.get(0),
            )?;
            Ok(stats)
        })
        .await
    }

    async fn finish_stats(&self) -> Result<FinishStats> {
        self.with_conn(|conn| {
            Ok(FinishStats {
                completed_fights: count(conn, "SELECT COUNT(*) FROM fights WHERE method IS NOT NULL")?
                    as i64,
                method_distribution: distribution(
                    conn,
                    "SELECT method, COUNT(*) FROM fights WHERE method IS NOT NULL GROUP BY method",
                    [],
                )?,
                round_distribution: distribution(
                    conn,
                    "SELECT round, COUNT(*) FROM fights
                     WHERE method IS NOT NULL AND round IS NOT NULL GROUP BY round",
                    [],
                )?,
            })
        })
        .await
    }

    async fn store_metric(
        &self,
        kind: MetricKind,
        data: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let data = serde_json::to_string(data)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO metrics (type, data, created_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), data, format_datetime(&created_at)],
            )?;
            Ok(())
        })
        .await
    }
}

/// Archive write transaction on its own connection.
///
/// All statements go through one mutex, so concurrent subtasks never
/// interleave on the connection. Rolled back on drop unless committed.
pub struct SqliteArchiveTransaction {
    conn: Arc<Mutex<Connection>>,
    finished: Arc<AtomicBool>,
}

impl SqliteArchiveTransaction {
    fn begin(path: &Path) -> Result<Self> {
        let conn = open_connection(path).context("Failed to open archive connection")?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin archive transaction")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            finished: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.finished.load(Ordering::SeqCst) {
            bail!("Archive transaction already finished");
        }
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .context("Archive task failed")?
    }
}

#[async_trait]
impl ArchiveTransaction for SqliteArchiveTransaction {
    async fn move_fight_to_history(&self, fight: &Fight) -> Result<()> {
        let fight = fight.clone();
        let details = serde_json::to_string(&fight)?;
        self.with_tx(move |conn| {
            let sp = conn.savepoint()?;
            sp.execute(
                "INSERT OR REPLACE INTO historical_fights
                    (id, event_id, fighter1_id, fighter2_id, weight_class, fight_date,
                     fight_details, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    fight.id,
                    fight.event_id,
                    fight.fighter1_id,
                    fight.fighter2_id,
                    fight.weight_class,
                    format_datetime(&fight.fight_date),
                    details,
                    format_datetime(&Utc::now()),
                ],
            )?;
            let deleted = sp.execute("DELETE FROM fights WHERE id = ?1", params![fight.id])?;
            if deleted == 0 {
                bail!("Fight {} vanished before it could be archived", fight.id);
            }
            sp.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_media_archived(&self, media_id: &str, storage_location: &str) -> Result<()> {
        let media_id = media_id.to_string();
        let storage_location = storage_location.to_string();
        self.with_tx(move |conn| {
            let updated = conn.execute(
                "UPDATE fight_media
                 SET storage_location = ?2, archive_location = ?2, is_archived = 1
                 WHERE id = ?1",
                params![media_id, storage_location],
            )?;
            if updated == 0 {
                bail!("Media {} not found", media_id);
            }
            Ok(())
        })
        .await
    }

    async fn maintain_partitions(&self) -> Result<usize> {
        self.with_tx(|conn| {
            conn.execute("DELETE FROM fight_partitions", [])?;
            let partitions = conn.execute(
                "INSERT INTO fight_partitions (year, fight_count, updated_at)
                 SELECT CAST(strftime('%Y', fight_date) AS INTEGER) AS year, COUNT(*), ?1
                 FROM (
                     SELECT fight_date FROM fights
                     UNION ALL
                     SELECT fight_date FROM historical_fights WHERE fight_date IS NOT NULL
                 )
                 GROUP BY year",
                params![format_datetime(&Utc::now())],
            )?;
            Ok(partitions)
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        let finished = Arc::clone(&self.finished);
        self.with_tx(move |conn| {
            conn.execute_batch("COMMIT")
                .context("Failed to commit archive transaction")?;
            finished.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
    }
}

impl Drop for SqliteArchiveTransaction {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => info!("Archive transaction rolled back"),
            Err(e) => warn!("Failed to roll back archive transaction: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn create_store() -> (SqliteDatastore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteDatastore::new(temp_dir.path().join("mma.db")).unwrap();
        (store, temp_dir)
    }

    fn fighter(id: &str, promotion: &str, weight_class: &str) -> Fighter {
        let mut f = Fighter::new(id, format!("Fighter {}", id), weight_class);
        f.promotion_id = Some(promotion.to_string());
        f
    }

    #[test]
    fn test_reopen_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mma.db");
        {
            let store = SqliteDatastore::new(&path).unwrap();
            store
                .insert_promotion(&Promotion {
                    id: "ufc".into(),
                    name: "UFC".into(),
                    active: true,
                })
                .unwrap();
        }
        let store = SqliteDatastore::new(&path).unwrap();
        assert_eq!(store.table_row_count("promotions").unwrap(), 1);
    }

    #[test]
    fn test_migrates_version_one_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            DATASTORE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        }

        let store = SqliteDatastore::new(&path).unwrap();
        assert_eq!(store.table_row_count("ranking_summary").unwrap(), 0);
        let version: i64 = store
            .lock()
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let (store, _dir) = create_store();
        assert!(store.table_row_count("sqlite_master; DROP TABLE fights").is_err());
    }

    #[tokio::test]
    async fn test_replace_rankings_tracks_previous_rank() {
        let (store, _dir) = create_store();
        for id in ["a", "b", "c"] {
            store.insert_fighter(&fighter(id, "ufc", "lightweight")).unwrap();
        }
        let now = Utc::now();

        let first_run = Uuid::new_v4();
        let ranked = vec![
            RankedFighter { fighter_id: "a".into(), points: 30.0 },
            RankedFighter { fighter_id: "b".into(), points: 20.0 },
            RankedFighter { fighter_id: "c".into(), points: 10.0 },
        ];
        let written = store
            .replace_rankings("ufc", "lightweight", &ranked, first_run, now)
            .await
            .unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|r| r.previous_rank.is_none()));

        let second_run = Uuid::new_v4();
        let ranked = vec![
            RankedFighter { fighter_id: "b".into(), points: 40.0 },
            RankedFighter { fighter_id: "a".into(), points: 30.0 },
        ];
        store
            .replace_rankings("ufc", "lightweight", &ranked, second_run, now)
            .await
            .unwrap();
        // retry of the same run must not overwrite previous ranks
        let written = store
            .replace_rankings("ufc", "lightweight", &ranked, second_run, now)
            .await
            .unwrap();

        assert_eq!(written.len(), 2, "fighter c is no longer ranked");
        assert_eq!(written[0].fighter_id, "b");
        assert_eq!(written[0].rank, 1);
        assert_eq!(written[0].previous_rank, Some(2));
        assert_eq!(written[1].fighter_id, "a");
        assert_eq!(written[1].rank, 2);
        assert_eq!(written[1].previous_rank, Some(1));
        assert!(written.iter().all(|r| r.run_id == second_run));
    }

    #[tokio::test]
    async fn test_refresh_ranking_views() {
        let (store, _dir) = create_store();
        store.insert_fighter(&fighter("a", "ufc", "lightweight")).unwrap();
        store.insert_fighter(&fighter("b", "ufc", "lightweight")).unwrap();
        let ranked = vec![
            RankedFighter { fighter_id: "a".into(), points: 10.0 },
            RankedFighter { fighter_id: "b".into(), points: 5.0 },
        ];
        store
            .replace_rankings("ufc", "lightweight", &ranked, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let reversed = vec![ranked[1].clone(), ranked[0].clone()];
        store
            .replace_rankings("ufc", "lightweight", &reversed, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        store.refresh_ranking_views().await.unwrap();
        let summary = store.ranking_summary("ufc", "lightweight").unwrap();
        assert_eq!(
            summary,
            vec![
                ("b".to_string(), "Fighter b".to_string(), 1, Some(1)),
                ("a".to_string(), "Fighter a".to_string(), 2, Some(-1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_archive_transaction_rolls_back_on_drop() {
        let (store, _dir) = create_store();
        let old = Utc::now() - ChronoDuration::days(800);
        store
            .insert_fight(&Fight::new("f1", "a", "b", "lightweight", old))
            .unwrap();

        {
            let tx = store.begin_archive().await.unwrap();
            let fight = store.get_fight("f1").unwrap().unwrap();
            tx.move_fight_to_history(&fight).await.unwrap();
        }

        assert!(store.get_fight("f1").unwrap().is_some());
        assert_eq!(store.table_row_count("historical_fights").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_archive_transaction_commit() {
        let (store, _dir) = create_store();
        let old = Utc::now() - ChronoDuration::days(800);
        store
            .insert_fight(&Fight::new("f1", "a", "b", "lightweight", old))
            .unwrap();

        let tx = store.begin_archive().await.unwrap();
        let fight = store.get_fight("f1").unwrap().unwrap();
        tx.move_fight_to_history(&fight).await.unwrap();
        assert_eq!(tx.maintain_partitions().await.unwrap(), 1);
        tx.commit().await.unwrap();
        assert!(tx.commit().await.is_err());
        drop(tx);

        assert!(store.get_fight("f1").unwrap().is_none());
        assert_eq!(store.table_row_count("historical_fights").unwrap(), 1);
        assert_eq!(store.table_row_count("fight_partitions").unwrap(), 1);
        assert!(store.verify_archive().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_duplicate_detection_and_merge() {
        let (store, _dir) = create_store();
        let mut original = Fighter::new("f-old", "Jon Doe", "heavyweight");
        original.created_at = Utc::now() - ChronoDuration::days(10);
        store.insert_fighter(&original).unwrap();
        store
            .insert_fighter(&Fighter::new("f-new", "Jon Doe", "heavyweight"))
            .unwrap();
        store
            .insert_fighter(&Fighter::new("f-other", "Someone Else", "heavyweight"))
            .unwrap();
        store
            .insert_fight(
                &Fight::new("fight", "f-new", "f-other", "heavyweight", Utc::now())
                    .with_result(FightResult::win("f-new", "ko", Some(1))),
            )
            .unwrap();

        let groups = store.get_duplicate_fighters().await.unwrap();
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                keep: "f-old".into(),
                duplicates: vec!["f-new".into()],
            }]
        );

        store.merge_fighters("f-old", &groups[0].duplicates).await.unwrap();
        assert!(store.get_fighter("f-new").unwrap().is_none());
        let fight = store.get_fight("fight").unwrap().unwrap();
        assert_eq!(fight.fighter1_id, "f-old");
        assert_eq!(fight.result.unwrap().winner_id.as_deref(), Some("f-old"));
    }

    #[tokio::test]
    async fn test_update_fight_result_sets_last_fight_date() {
        let (store, _dir) = create_store();
        store.insert_fighter(&Fighter::new("a", "A", "flyweight")).unwrap();
        store.insert_fighter(&Fighter::new("b", "B", "flyweight")).unwrap();
        let date = Utc::now() - ChronoDuration::days(3);
        store
            .insert_fight(&Fight::new("f", "a", "b", "flyweight", date))
            .unwrap();

        let pending = store.get_fights_without_results(Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .update_fight_result("f", &FightResult::win("a", "submission", Some(2)))
            .await
            .unwrap();

        assert!(store.get_fights_without_results(Utc::now()).await.unwrap().is_empty());
        let a = store.get_fighter("a").unwrap().unwrap();
        assert_eq!(
            a.last_fight_date.map(|d| d.timestamp_millis()),
            Some(date.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_stats_queries() {
        let (store, _dir) = create_store();
        let mut a = Fighter::new("a", "A", "flyweight");
        a.age = Some(30);
        a.record = FighterRecord { wins: 10, losses: 2, draws: 1, no_contests: 0 };
        let mut b = Fighter::new("b", "B", "bantamweight");
        b.age = Some(24);
        b.record = FighterRecord { wins: 5, losses: 5, draws: 0, no_contests: 1 };
        store.insert_fighter(&a).unwrap();
        store.insert_fighter(&b).unwrap();

        let mut event = Event::new("e1", "Fight Night", Utc::now() - ChronoDuration::days(30));
        event.venue = Some("Arena".into());
        event.attendance = Some(10_000);
        store.insert_event(&event).unwrap();
        let mut fight = Fight::new("f1", "a", "b", "flyweight", event.date)
            .title_fight()
            .with_result(FightResult::win("a", "ko", Some(2)));
        fight.event_id = Some("e1".into());
        store.insert_fight(&fight).unwrap();

        let fighters = store.fighter_stats().await.unwrap();
        assert_eq!(fighters.total_active, 2);
        assert_eq!(fighters.average_age, Some(27.0));
        assert_eq!(fighters.total_wins, 15);
        assert_eq!(fighters.weight_class_distribution.get("flyweight"), Some(&1));

        let events = store
            .event_stats(Utc::now() - ChronoDuration::days(365))
            .await
            .unwrap();
        assert_eq!(events.total_events, 1);
        assert_eq!(events.average_attendance, Some(10_000.0));
        assert_eq!(events.average_ppv_buys, None);
        assert_eq!(events.title_fights, 1);

        let finishes = store.finish_stats().await.unwrap();
        assert_eq!(finishes.completed_fights, 1);
        assert_eq!(finishes.method_distribution.get("ko"), Some(&1));
        assert_eq!(finishes.round_distribution.get(&2), Some(&1));
    }

    #[test]
    fn test_group_duplicates() {
        let rows = vec![
            ("x".to_string(), "1".to_string()),
            ("x".to_string(), "2".to_string()),
            ("y".to_string(), "3".to_string()),
            ("z".to_string(), "4".to_string()),
            ("z".to_string(), "5".to_string()),
            ("z".to_string(), "6".to_string()),
        ];
        let groups = group_duplicates(rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].keep, "1");
        assert_eq!(groups[1].duplicates, vec!["5".to_string(), "6".to_string()]);
    }
}
