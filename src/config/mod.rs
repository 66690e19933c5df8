mod file_config;

pub use file_config::{FileConfig, JobFileConfig, RetryFileConfig};

use crate::background_jobs::jobs::{ArchiveConfig, CleanupConfig, RankingConfig, ScraperConfig};
use crate::background_jobs::{JobDefinition, RetryPolicy};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,

    pub jobs: HashMap<String, JobDefinition>,
    pub retry: RetryPolicy,

    pub rankings: RankingConfig,
    pub archive: ArchiveConfig,
    pub cleanup: CleanupConfig,
    pub scraper: ScraperConfig,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let mut jobs = default_job_definitions();
        for (name, overrides) in file.jobs {
            let definition = jobs
                .get_mut(&name)
                .ok_or_else(|| anyhow!("Unknown job in config file: {}", name))?;
            if let Some(enabled) = overrides.enabled {
                definition.enabled = enabled;
            }
            if let Some(schedule) = overrides.schedule {
                definition.schedule = schedule;
            }
            if let Some(timeout_secs) = overrides.timeout_secs {
                definition.timeout = Duration::from_secs(timeout_secs);
            }
            if let Some(retry_attempts) = overrides.retry_attempts {
                definition.max_retries = retry_attempts;
            }
        }

        // Disabled jobs are never parsed, so a broken schedule there is fine.
        for definition in jobs.values().filter(|d| d.enabled) {
            definition.parse_schedule()?;
        }

        let retry_file = file.retry.unwrap_or_default();
        let retry = RetryPolicy {
            backoff_base: retry_file
                .backoff_base_secs
                .map(Duration::from_secs)
                .unwrap_or(RetryPolicy::default().backoff_base),
        };

        Ok(Self {
            db_path,
            metrics_port,
            jobs,
            retry,
            rankings: file.rankings.unwrap_or_default(),
            archive: file.archive.unwrap_or_default(),
            cleanup: file.cleanup.unwrap_or_default(),
            scraper: file.scraper.unwrap_or_default(),
        })
    }
}

const HOUR: u64 = 60 * 60;

/// Schedule, timeout and retries of every known job.
pub fn default_job_definitions() -> HashMap<String, JobDefinition> {
    [
        ("rankings", "@weekly", HOUR, 3),
        ("scraping", "@daily", 2 * HOUR, 5),
        ("cleanup", "@daily", 30 * 60, 2),
        ("archive", "@monthly", 4 * HOUR, 3),
        ("metrics", "@hourly", 15 * 60, 2),
    ]
    .into_iter()
    .map(|(name, schedule, timeout_secs, retries)| {
        (
            name.to_string(),
            JobDefinition::new(name, schedule, Duration::from_secs(timeout_secs), retries),
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn cli_for(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(temp_dir.path().join("mma.db")),
            metrics_port: 9091,
        }
    }

    fn write_config(temp_dir: &TempDir, content: &str) -> PathBuf {
        let path = temp_dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_for(&temp_dir), None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("mma.db"));
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.jobs.len(), 5);
        assert_eq!(config.retry.backoff_base, Duration::from_secs(2));
        assert_eq!(config.rankings, RankingConfig::default());
        assert_eq!(config.scraper.concurrency, 5);

        let rankings = &config.jobs["rankings"];
        assert_eq!(rankings.schedule, "@weekly");
        assert_eq!(rankings.timeout, Duration::from_secs(3600));
        assert_eq!(rankings.max_retries, 3);
        assert!(rankings.enabled);
    }

    #[test]
    fn test_missing_db_path_rejected() {
        let err = AppConfig::resolve(&CliConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("db_path must be specified"));
    }

    #[test]
    fn test_missing_db_directory_rejected() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/definitely/not/here/mma.db")),
            metrics_port: 0,
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_file_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
metrics_port = 0

[jobs.scraping]
enabled = false
schedule = "not a schedule"

[jobs.metrics]
schedule = "0 */10 * * * *"
timeout_secs = 60
retry_attempts = 0

[retry]
backoff_base_secs = 5

[rankings]
considerable_fights = 3

[archive]
archive_age_days = 730

[scraper]
base_url = "http://upstream:9000"
"#,
        );

        let file = FileConfig::load(&path).unwrap();
        let config = AppConfig::resolve(&cli_for(&temp_dir), Some(file)).unwrap();

        assert_eq!(config.metrics_port, 0);
        assert!(!config.jobs["scraping"].enabled);
        let metrics = &config.jobs["metrics"];
        assert_eq!(metrics.schedule, "0 */10 * * * *");
        assert_eq!(metrics.timeout, Duration::from_secs(60));
        assert_eq!(metrics.max_retries, 0);
        assert_eq!(config.retry.backoff_base, Duration::from_secs(5));

        assert_eq!(config.rankings.considerable_fights, 3);
        assert_eq!(config.rankings.win_points, 10.0);
        assert_eq!(config.archive.archive_age_days, 730);
        assert_eq!(config.archive.batch_size, 100);
        assert_eq!(config.scraper.base_url, "http://upstream:9000");
        assert_eq!(config.scraper.request_delay_ms, 2000);
    }

    #[test]
    fn test_invalid_schedule_for_enabled_job_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[jobs.cleanup]\nschedule = \"every tuesday\"\n");
        let file = FileConfig::load(&path).unwrap();
        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file)).unwrap_err();
        assert!(err.to_string().contains("cleanup"), "{}", err);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[jobs.archive]\ntimeout_secs = 0\n");
        let file = FileConfig::load(&path).unwrap();
        assert!(AppConfig::resolve(&cli_for(&temp_dir), Some(file)).is_err());
    }

    #[test]
    fn test_unknown_job_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[jobs.backfill]\nenabled = true\n");
        let file = FileConfig::load(&path).unwrap();
        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file)).unwrap_err();
        assert!(err.to_string().contains("backfill"));
    }

    #[test]
    fn test_default_schedules_parse() {
        for definition in default_job_definitions().values() {
            definition.parse_schedule().unwrap();
        }
    }
}
