//! HTTP client for the upstream fight data service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::ScraperService;
use crate::datastore::{Event, EventDetails, Fight, Fighter, FighterProfile, ScrapedFightResult};

/// Fetches entity data from `{base_url}/fighters/{id}`, `{base_url}/events/{id}`
/// and `{base_url}/fights/{id}/result`.
pub struct HttpScraperClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScraperClient {
    pub fn new(base_url: &str, timeout_sec: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", what))?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch {}: status {}", what, response.status());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

#[async_trait]
impl ScraperService for HttpScraperClient {
    async fn scrape_fighter(&self, fighter: &Fighter) -> Result<FighterProfile> {
        self.get_json(
            &format!("/fighters/{}", fighter.id),
            &format!("fighter {}", fighter.id),
        )
        .await
    }

    async fn scrape_event(&self, event: &Event) -> Result<EventDetails> {
        self.get_json(
            &format!("/events/{}", event.id),
            &format!("event {}", event.id),
        )
        .await
    }

    async fn scrape_fight_result(&self, fight: &Fight) -> Result<ScrapedFightResult> {
        self.get_json(
            &format!("/fights/{}/result", fight.id),
            &format!("fight result {}", fight.id),
        )
        .await
    }
}
