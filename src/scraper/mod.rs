//! Scraping collaborator used by the scraping job.
//!
//! [`ScraperService`] fetches fresh data for stored entities. The default
//! implementation talks to an upstream JSON service over HTTP.

mod client;

pub use client::HttpScraperClient;

use crate::datastore::{Event, EventDetails, Fight, Fighter, FighterProfile, ScrapedFightResult};
use anyhow::{bail, Result};
use async_trait::async_trait;

#[async_trait]
pub trait ScraperService: Send + Sync {
    async fn scrape_fighter(&self, fighter: &Fighter) -> Result<FighterProfile>;

    async fn scrape_event(&self, event: &Event) -> Result<EventDetails>;

    async fn scrape_fight_result(&self, fight: &Fight) -> Result<ScrapedFightResult>;
}

pub fn validate_fighter_profile(profile: &FighterProfile) -> Result<()> {
    if profile.name.trim().is_empty() {
        bail!("fighter name cannot be empty");
    }
    Ok(())
}

pub fn validate_event_details(details: &EventDetails) -> Result<()> {
    if details.name.trim().is_empty() {
        bail!("event name cannot be empty");
    }
    Ok(())
}

/// The scraped fight must name both fighters, and a winner must be one of them.
pub fn validate_fight_result(scraped: &ScrapedFightResult) -> Result<()> {
    if scraped.fighter1_id.is_empty() || scraped.fighter2_id.is_empty() {
        bail!("fight must have two fighters");
    }
    if let Some(winner) = &scraped.result.winner_id {
        if *winner != scraped.fighter1_id && *winner != scraped.fighter2_id {
            bail!("winner {} did not take part in the fight", winner);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{FightResult, FighterRecord};

    fn profile(name: &str) -> FighterProfile {
        FighterProfile {
            name: name.to_string(),
            nickname: None,
            weight_class: None,
            age: None,
            status: None,
            record: FighterRecord::default(),
        }
    }

    #[test]
    fn test_fighter_name_required() {
        assert!(validate_fighter_profile(&profile("Jon Doe")).is_ok());
        assert!(validate_fighter_profile(&profile("  ")).is_err());
    }

    #[test]
    fn test_event_name_required() {
        let details = EventDetails {
            name: String::new(),
            date: None,
            venue: None,
            attendance: None,
            ppv_buys: None,
            status: None,
        };
        assert!(validate_event_details(&details).is_err());
    }

    #[test]
    fn test_fight_result_validation() {
        let valid = ScrapedFightResult {
            fighter1_id: "a".into(),
            fighter2_id: "b".into(),
            result: FightResult::win("a", "ko", Some(1)),
        };
        assert!(validate_fight_result(&valid).is_ok());

        let missing_fighter = ScrapedFightResult {
            fighter2_id: String::new(),
            ..valid.clone()
        };
        assert!(validate_fight_result(&missing_fighter).is_err());

        let outsider = ScrapedFightResult {
            result: FightResult::win("c", "ko", Some(1)),
            ..valid
        };
        assert!(validate_fight_result(&outsider).is_err());
    }
}
