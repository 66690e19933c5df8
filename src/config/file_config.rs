use crate::background_jobs::jobs::{ArchiveConfig, CleanupConfig, RankingConfig, ScraperConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub metrics_port: Option<u16>,

    /// Per-job overrides, keyed by job name.
    pub jobs: HashMap<String, JobFileConfig>,
    pub retry: Option<RetryFileConfig>,

    // Job settings; missing keys keep their defaults
    pub rankings: Option<RankingConfig>,
    pub archive: Option<ArchiveConfig>,
    pub cleanup: Option<CleanupConfig>,
    pub scraper: Option<ScraperConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobFileConfig {
    pub enabled: Option<bool>,
    pub schedule: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryFileConfig {
    pub backoff_base_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
