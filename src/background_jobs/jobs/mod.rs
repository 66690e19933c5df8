//! Specific background job implementations.
//!
//! Each job implements [`BackgroundJob`](super::BackgroundJob) and splits
//! its work into concurrent subtasks with [`FanOut`](super::FanOut).

pub mod archive;
pub mod cleanup;
pub mod metrics;
pub mod rankings;
pub mod scraping;

pub use archive::{ArchiveConfig, ArchiveJob, MediaArchiver, NoOpMediaArchiver};
pub use cleanup::{CleanupConfig, CleanupJob};
pub use metrics::MetricsJob;
pub use rankings::{RankingConfig, RankingsJob};
pub use scraping::{ScraperConfig, ScrapingJob};
