//! Scraping background job.
//!
//! Refreshes stale fighters, upcoming events and missing fight results from
//! the upstream data source. Fighters are fetched with bounded concurrency,
//! events and results one at a time with a delay between requests.

use crate::background_jobs::{BackgroundJob, FanOut, JobContext, JobError};
use crate::datastore::{EventStore, FightStore, FighterStore};
use crate::scraper::{
    validate_event_details, validate_fight_result, validate_fighter_profile, ScraperService,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Fighters scraped in parallel.
    pub concurrency: usize,
    pub request_delay_ms: u64,
    /// Fighters not updated for this many days are refreshed.
    pub update_window_days: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
            concurrency: 5,
            request_delay_ms: 2000,
            update_window_days: 7,
        }
    }
}

#[derive(Clone)]
pub struct ScrapingJob {
    scraper: Arc<dyn ScraperService>,
    fighters: Arc<dyn FighterStore>,
    fights: Arc<dyn FightStore>,
    events: Arc<dyn EventStore>,
    config: ScraperConfig,
}

impl ScrapingJob {
    pub fn new<S>(store: Arc<S>, scraper: Arc<dyn ScraperService>, config: ScraperConfig) -> Self
    where
        S: FighterStore + FightStore + EventStore + 'static,
    {
        Self {
            scraper,
            fighters: store.clone(),
            fights: store.clone(),
            events: store,
            config,
        }
    }

    fn request_delay(&self) -> Duration {
        Duration::from_millis(self.config.request_delay_ms)
    }

    async fn update_fighters(&self, ctx: &JobContext) -> Result<(), JobError> {
        let stale_before = Utc::now() - ChronoDuration::days(self.config.update_window_days as i64);
        let fighters = self.fighters.get_fighters_to_update(stale_before).await?;
        let total = fighters.len();
        let updated = AtomicUsize::new(0);

        stream::iter(fighters)
            .for_each_concurrent(self.config.concurrency.max(1), |fighter| {
                let updated = &updated;
                async move {
                    if ctx.is_cancelled() {
                        return;
                    }
                    let result = async {
                        let profile = self.scraper.scrape_fighter(&fighter).await?;
                        validate_fighter_profile(&profile)?;
                        self.fighters.update_fighter(&fighter.id, &profile).await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            updated.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!(
                            "[{}] failed to update fighter {}: {:#}",
                            ctx.job_id, fighter.id, e
                        ),
                    }
                }
            })
            .await;

        ctx.check()?;
        info!(
            "[{}] updated {}/{} fighters",
            ctx.job_id,
            updated.load(Ordering::Relaxed),
            total
        );
        Ok(())
    }

    async fn update_events(&self, ctx: &JobContext) -> Result<(), JobError> {
        let events = self.events.get_upcoming_events(Utc::now()).await?;
        let mut updated = 0;
        for (index, event) in events.iter().enumerate() {
            if index > 0 {
                ctx.sleep(self.request_delay()).await?;
            }
            ctx.check()?;

            let result = async {
                let details = self.scraper.scrape_event(event).await?;
                validate_event_details(&details)?;
                self.events.update_event(&event.id, &details).await
            }
            .await;
            match result {
                Ok(()) => updated += 1,
                Err(e) => warn!(
                    "[{}] failed to update event {}: {:#}",
                    ctx.job_id, event.id, e
                ),
            }
        }

        info!("[{}] updated {}/{} events", ctx.job_id, updated, events.len());
        Ok(())
    }

    async fn update_fight_results(&self, ctx: &JobContext) -> Result<(), JobError> {
        let fights = self.fights.get_fights_without_results(Utc::now()).await?;
        let mut updated = 0;
        for (index, fight) in fights.iter().enumerate() {
            if index > 0 {
                ctx.sleep(self.request_delay()).await?;
            }
            ctx.check()?;

            let result: Result<()> = async {
                let scraped = self.scraper.scrape_fight_result(fight).await?;
                validate_fight_result(&scraped)?;
                let same_pair = (scraped.fighter1_id == fight.fighter1_id
                    && scraped.fighter2_id == fight.fighter2_id)
                    || (scraped.fighter1_id == fight.fighter2_id
                        && scraped.fighter2_id == fight.fighter1_id);
                if !same_pair {
                    bail!("scraped fighters do not match the stored fight");
                }
                self.fights.update_fight_result(&fight.id, &scraped.result).await
            }
            .await;
            match result {
                Ok(()) => updated += 1,
                Err(e) => warn!(
                    "[{}] failed to update fight result {}: {:#}",
                    ctx.job_id, fight.id, e
                ),
            }
        }

        debug!("[{}] {} fights were missing results", ctx.job_id, fights.len());
        info!("[{}] updated {} fight results", ctx.job_id, updated);
        Ok(())
    }
}

#[async_trait]
impl BackgroundJob for ScrapingJob {
    fn id(&self) -> &'static str {
        "scraping"
    }

    fn name(&self) -> &'static str {
        "Scraping"
    }

    fn description(&self) -> &'static str {
        "Refresh fighters, events and fight results from the upstream source"
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.check()?;

        let mut group = FanOut::new(ctx);
        let job = self.clone();
        group.spawn("fighters", move |ctx| async move { job.update_fighters(&ctx).await });
        let job = self.clone();
        group.spawn("events", move |ctx| async move { job.update_events(&ctx).await });
        let job = self.clone();
        group.spawn("fight_results", move |ctx| async move {
            job.update_fight_results(&ctx).await
        });

        group.join().await?;
        info!("[{}] scraping finished", ctx.job_id);
        Ok(())
    }
}
