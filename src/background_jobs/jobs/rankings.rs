//! Rankings background job.
//!
//! Scores every active fighter from their recent fights and rewrites the
//! ranking table of each (promotion, weight class). Promotions are processed
//! concurrently, one subtask each.

use crate::background_jobs::{BackgroundJob, FanOut, JobContext, JobError};
use crate::datastore::{
    Fight, FightStore, Fighter, FighterStore, Promotion, PromotionStore, RankedFighter,
    RankingStore, METHOD_DECISION, METHOD_DRAW,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scoring constants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub win_points: f64,
    pub loss_points: f64,
    pub draw_points: f64,
    pub title_fight_bonus: f64,
    pub finish_bonus: f64,
    /// Negative points per month of inactivity.
    pub inactivity_penalty: f64,
    pub max_inactive_months: u32,
    /// How many of the most recent fights count towards the score.
    pub considerable_fights: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            win_points: 10.0,
            loss_points: -5.0,
            draw_points: 2.0,
            title_fight_bonus: 5.0,
            finish_bonus: 2.0,
            inactivity_penalty: -1.0,
            max_inactive_months: 12,
            considerable_fights: 5,
        }
    }
}

/// Months between two instants, counting 30-day months.
pub fn months_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_hours() as f64 / 24.0 / 30.0
}

/// Points `fighter_id` earned in `fight`, before recency weighting.
pub fn fight_points(config: &RankingConfig, fight: &Fight, fighter_id: &str) -> f64 {
    let Some(result) = &fight.result else {
        return 0.0;
    };

    if result.winner_id.as_deref() == Some(fighter_id) {
        let mut points = config.win_points;
        if fight.is_title_fight {
            points += config.title_fight_bonus;
        }
        if result.method != METHOD_DECISION {
            points += config.finish_bonus;
        }
        points
    } else if result.method == METHOD_DRAW {
        config.draw_points
    } else {
        config.loss_points
    }
}

/// Weight of a fight that happened `months_ago` months before scoring.
pub fn recency_multiplier(months_ago: f64) -> f64 {
    (1.0 - months_ago * 0.02).max(0.5)
}

pub fn inactivity_penalty(
    config: &RankingConfig,
    last_fight_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let max_months = config.max_inactive_months as f64;
    match last_fight_date {
        None => config.inactivity_penalty * max_months,
        Some(date) => {
            let inactive = months_between(date, now);
            if inactive > max_months {
                config.inactivity_penalty * inactive
            } else {
                0.0
            }
        }
    }
}

/// Total score of a fighter given their recent fights.
pub fn fighter_points(
    config: &RankingConfig,
    fighter: &Fighter,
    recent_fights: &[Fight],
    now: DateTime<Utc>,
) -> f64 {
    let fights_total: f64 = recent_fights
        .iter()
        .map(|fight| {
            fight_points(config, fight, &fighter.id)
                * recency_multiplier(months_between(fight.fight_date, now))
        })
        .sum();
    fights_total + inactivity_penalty(config, fighter.last_fight_date, now)
}

/// Order by descending points. Equal scores are ordered by fighter id.
pub fn rank_fighters(mut scored: Vec<RankedFighter>) -> Vec<RankedFighter> {
    scored.sort_by(|a, b| {
        b.points
            .partial_cmp(&a.points)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.fighter_id.cmp(&b.fighter_id))
    });
    scored
}

#[derive(Clone)]
pub struct RankingsJob {
    promotions: Arc<dyn PromotionStore>,
    fighters: Arc<dyn FighterStore>,
    fights: Arc<dyn FightStore>,
    rankings: Arc<dyn RankingStore>,
    config: RankingConfig,
}

impl RankingsJob {
    pub fn new<S>(store: Arc<S>, config: RankingConfig) -> Self
    where
        S: PromotionStore + FighterStore + FightStore + RankingStore + 'static,
    {
        Self {
            promotions: store.clone(),
            fighters: store.clone(),
            fights: store.clone(),
            rankings: store,
            config,
        }
    }

    async fn update_promotion(
        &self,
        ctx: &JobContext,
        promotion: &Promotion,
        effective_date: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let weight_classes = self
            .rankings
            .get_active_weight_classes(&promotion.id)
            .await?;

        let mut updated = 0;
        for weight_class in &weight_classes {
            ctx.check()?;
            match self
                .update_weight_class(ctx, &promotion.id, weight_class, effective_date)
                .await
            {
                Ok(ranked) => {
                    updated += 1;
                    debug!(
                        "[{}] ranked {} fighters in {} {}",
                        ctx.job_id, ranked, promotion.name, weight_class
                    );
                }
                Err(e) if e.is_context_error() => return Err(e),
                Err(e) => warn!(
                    "[{}] failed to update {} {} rankings: {}",
                    ctx.job_id, promotion.name, weight_class, e
                ),
            }
        }

        info!(
            "[{}] updated {}/{} weight classes of {}",
            ctx.job_id,
            updated,
            weight_classes.len(),
            promotion.name
        );
        Ok(())
    }

    async fn update_weight_class(
        &self,
        ctx: &JobContext,
        promotion_id: &str,
        weight_class: &str,
        effective_date: DateTime<Utc>,
    ) -> Result<usize, JobError> {
        let fighters = self
            .fighters
            .get_fighters_in_division(promotion_id, weight_class)
            .await?;

        let mut scored = Vec::with_capacity(fighters.len());
        for fighter in &fighters {
            ctx.check()?;
            match self
                .fights
                .get_recent_fights(&fighter.id, self.config.considerable_fights)
                .await
            {
                Ok(fights) => scored.push(RankedFighter {
                    fighter_id: fighter.id.clone(),
                    points: fighter_points(&self.config, fighter, &fights, effective_date),
                }),
                Err(e) => warn!(
                    "[{}] skipping fighter {}: {:#}",
                    ctx.job_id, fighter.id, e
                ),
            }
        }

        let ranked = rank_fighters(scored);
        let written = self
            .rankings
            .replace_rankings(
                promotion_id,
                weight_class,
                &ranked,
                ctx.run_id,
                effective_date,
            )
            .await?;
        Ok(written.len())
    }
}

#[async_trait]
impl BackgroundJob for RankingsJob {
    fn id(&self) -> &'static str {
        "rankings"
    }

    fn name(&self) -> &'static str {
        "Rankings"
    }

    fn description(&self) -> &'static str {
        "Recompute fighter rankings for every promotion and weight class"
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;

        let promotions = self.promotions.get_active_promotions().await?;
        info!(
            "[{}] updating rankings for {} promotions",
            ctx.job_id,
            promotions.len()
        );

        let effective_date = Utc::now();
        let mut group = FanOut::new(ctx);
        for promotion in promotions {
            let job = self.clone();
            group.spawn(format!("promotion {}", promotion.id), move |ctx| async move {
                job.update_promotion(&ctx, &promotion, effective_date).await
            });
        }
        group.join().await?;

        self.rankings.refresh_ranking_views().await?;
        info!("[{}] rankings updated", ctx.job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{FightResult, SqliteDatastore};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn title_ko(fighter_id: &str, date: DateTime<Utc>) -> Fight {
        Fight::new("f", fighter_id, "opponent", "lightweight", date)
            .title_fight()
            .with_result(FightResult::win(fighter_id, "ko", Some(1)))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_recent_title_finish_scores_full_points() {
        let config = RankingConfig::default();
        let now = Utc::now();
        let fight = title_ko("a", now);
        assert_close(
            fight_points(&config, &fight, "a") * recency_multiplier(months_between(now, now)),
            17.0,
        );
    }

    #[test]
    fn test_old_fight_hits_recency_floor() {
        let config = RankingConfig::default();
        let now = Utc::now();
        let fight = title_ko("a", now - ChronoDuration::days(30 * 30));
        let months = months_between(fight.fight_date, now);
        assert_close(months, 30.0);
        assert_close(
            fight_points(&config, &fight, "a") * recency_multiplier(months),
            8.5,
        );
    }

    #[test]
    fn test_fight_points_by_outcome() {
        let config = RankingConfig::default();
        let now = Utc::now();
        let decision = Fight::new("f", "a", "b", "lightweight", now)
            .with_result(FightResult::win("a", "decision", Some(3)));
        assert_close(fight_points(&config, &decision, "a"), 10.0);
        assert_close(fight_points(&config, &decision, "b"), -5.0);

        let draw = Fight::new("f", "a", "b", "lightweight", now).with_result(FightResult::draw());
        assert_close(fight_points(&config, &draw, "a"), 2.0);

        let pending = Fight::new("f", "a", "b", "lightweight", now);
        assert_close(fight_points(&config, &pending, "a"), 0.0);
    }

    #[test]
    fn test_inactivity_penalty() {
        let config = RankingConfig::default();
        let now = Utc::now();

        let never_fought = Fighter::new("a", "A", "lightweight");
        assert_close(inactivity_penalty(&config, None, now), -12.0);
        let fights = vec![title_ko("a", now)];
        assert_close(fighter_points(&config, &never_fought, &fights, now), 17.0 - 12.0);

        let recent = Some(now - ChronoDuration::days(30 * 6));
        assert_close(inactivity_penalty(&config, recent, now), 0.0);

        let long_ago = Some(now - ChronoDuration::days(30 * 18));
        assert_close(inactivity_penalty(&config, long_ago, now), -18.0);
    }

    #[test]
    fn test_rank_fighters_breaks_ties_by_id() {
        let ranked = rank_fighters(vec![
            RankedFighter { fighter_id: "c".into(), points: 5.0 },
            RankedFighter { fighter_id: "b".into(), points: 9.0 },
            RankedFighter { fighter_id: "a".into(), points: 5.0 },
        ]);
        let ids: Vec<_> = ranked.iter().map(|r| r.fighter_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_job_metadata_and_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteDatastore::new(temp_dir.path().join("mma.db")).unwrap());
        store
            .insert_promotion(&Promotion {
                id: "ufc".into(),
                name: "UFC".into(),
                active: true,
            })
            .unwrap();
        let now = Utc::now();
        for id in ["a", "b"] {
            let mut fighter = Fighter::new(id, id.to_uppercase(), "lightweight");
            fighter.promotion_id = Some("ufc".into());
            fighter.last_fight_date = Some(now);
            store.insert_fighter(&fighter).unwrap();
        }
        store
            .insert_fight(
                &Fight::new("f1", "a", "b", "lightweight", now)
                    .with_result(FightResult::win("b", "submission", Some(2))),
            )
            .unwrap();

        let job = RankingsJob::new(store.clone(), RankingConfig::default());
        assert_eq!(job.id(), "rankings");

        let ctx = JobContext::new(
            job.id(),
            Uuid::new_v4(),
            CancellationToken::new(),
            Duration::from_secs(30),
        );
        job.run(&ctx).await.unwrap();

        let rankings = store.get_current_rankings("ufc", "lightweight").await.unwrap();
        assert_eq!(rankings.len(), 2);
        assert_eq!(rankings[0].fighter_id, "b");
        assert_close(rankings[0].points, 12.0);
        assert_eq!(rankings[1].fighter_id, "a");
        assert_close(rankings[1].points, -5.0);
        assert!(rankings.iter().all(|r| r.run_id == ctx.run_id));
        assert_eq!(store.ranking_summary("ufc", "lightweight").unwrap().len(), 2);
    }
}
