use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mma_scheduler::background_jobs::jobs::{
    ArchiveJob, CleanupJob, MetricsJob, NoOpMediaArchiver, RankingsJob, ScrapingJob,
};
use mma_scheduler::background_jobs::{RunOutcome, Scheduler};
use mma_scheduler::config::{AppConfig, CliConfig, FileConfig};
use mma_scheduler::datastore::SqliteDatastore;
use mma_scheduler::scraper::HttpScraperClient;
use mma_scheduler::server::{run_metrics_server, MetricsSink, PrometheusMetrics};

/// How long in-flight runs get to stop after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[clap(version, about = "Runs the fight data maintenance jobs on their schedules")]
struct CliArgs {
    /// Path to the SQLite database file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Its values override the CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the scheduler until interrupted (default).
    Serve,
    /// Run one job now and wait for it to finish.
    Run {
        /// Name of the job, e.g. "rankings".
        job: String,
    },
    /// Print the configured jobs.
    List,
}

fn build_scheduler(
    config: &AppConfig,
    store: Arc<SqliteDatastore>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Scheduler> {
    let mut scheduler = Scheduler::new(config.jobs.clone(), config.retry, metrics);

    let scraper = Arc::new(HttpScraperClient::new(
        &config.scraper.base_url,
        config.scraper.timeout_secs,
    )?);

    scheduler.register_job(Arc::new(RankingsJob::new(
        store.clone(),
        config.rankings.clone(),
    )))?;
    scheduler.register_job(Arc::new(ScrapingJob::new(
        store.clone(),
        scraper,
        config.scraper.clone(),
    )))?;
    scheduler.register_job(Arc::new(CleanupJob::new(
        store.clone(),
        config.cleanup.clone(),
    )))?;
    scheduler.register_job(Arc::new(ArchiveJob::new(
        store.clone(),
        Arc::new(NoOpMediaArchiver),
        config.archive.clone(),
    )))?;
    scheduler.register_job(Arc::new(MetricsJob::new(store)))?;

    Ok(scheduler)
}

async fn serve(
    config: &AppConfig,
    mut scheduler: Scheduler,
    metrics: Arc<PrometheusMetrics>,
) -> Result<()> {
    let shutdown = CancellationToken::new();

    let metrics_task = if config.metrics_port != 0 {
        Some(tokio::spawn(run_metrics_server(
            metrics,
            config.metrics_port,
            shutdown.clone(),
        )))
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    scheduler.start()?;
    info!(
        "Scheduler running with {} scheduled jobs",
        scheduler.scheduled_count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    scheduler.shutdown(SHUTDOWN_GRACE).await;
    shutdown.cancel();

    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Metrics server failed: {:#}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }
    }
    Ok(())
}

async fn run_once(scheduler: &Scheduler, job: &str) -> Result<()> {
    match scheduler.run_job_now(job).await? {
        RunOutcome::Succeeded { attempts } => {
            info!("Job {} succeeded after {} attempt(s)", job, attempts);
            Ok(())
        }
        RunOutcome::Failed(e) => bail!("Job {} failed: {}", job, e),
        RunOutcome::Skipped => bail!("Job {} is already running", job),
    }
}

fn print_jobs(scheduler: &Scheduler) {
    for job in scheduler.list_jobs() {
        let next_run = job
            .next_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<8} {:<16} timeout={}s retries={} next={}",
            job.id,
            if job.enabled { "enabled" } else { "disabled" },
            job.schedule,
            job.timeout_secs,
            job.max_retries,
            next_run
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        metrics_port: cli_args.metrics_port,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening SQLite datastore at {:?}...", config.db_path);
    let store = Arc::new(SqliteDatastore::new(&config.db_path)?);

    info!("Initializing metrics...");
    let metrics = Arc::new(PrometheusMetrics::new().context("Failed to initialize metrics")?);

    let scheduler = build_scheduler(&config, store, metrics.clone())?;

    match cli_args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, scheduler, metrics).await,
        Command::Run { job } => run_once(&scheduler, &job).await,
        Command::List => {
            print_jobs(&scheduler);
            Ok(())
        }
    }
}
