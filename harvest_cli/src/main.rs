//! Thin command-line front-end: argument parsing, wiring, and JSON output.
//! Exit code 0 on success, non-zero on validation or operational failure.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use gallery_client::HttpFetcher;
use harvest_core::config::{Engine, RunConfig};
use harvest_download::HttpDownloader;
use harvest_pipeline::HarvestPipeline;
use harvest_store::StateStore;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Resumable templated image harvester")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a harvesting job over a templated page range.
    Run(RunArgs),
    /// Show aggregated stats and recent events for a job.
    Status(StatusArgs),
    /// Retry failed images of an existing job.
    RetryFailed(RetryArgs),
    /// Export the job-level metadata summary JSON.
    Export(ExportArgs),
}

#[derive(Args)]
struct RunArgs {
    /// URL template containing the literal `{num}` placeholder.
    #[arg(long)]
    url_template: String,
    /// First page number (inclusive).
    #[arg(long)]
    start_num: i32,
    /// Last page number (inclusive); unbounded when omitted.
    #[arg(long)]
    end_num: Option<i32>,
    /// CSS selector for image elements.
    #[arg(long)]
    selector: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    state_db: Option<PathBuf>,
    /// Fetch engine: `requests` or `playwright`.
    #[arg(long)]
    engine: Option<String>,
    /// Start the job from scratch instead of resuming.
    #[arg(long)]
    no_resume: bool,
    #[arg(long)]
    page_timeout_sec: Option<f64>,
    #[arg(long)]
    image_timeout_sec: Option<f64>,
    #[arg(long)]
    image_retries: Option<u32>,
    #[arg(long)]
    page_retries: Option<u32>,
    #[arg(long)]
    request_delay_sec: Option<f64>,
    #[arg(long)]
    stop_after_consecutive_page_failures: Option<u32>,
    /// Consult a fallback fetcher once when a page parses to zero images.
    #[arg(long)]
    playwright_fallback: bool,
    /// Selector for the advertised total image count.
    #[arg(long)]
    sequence_count_selector: Option<String>,
    /// Allow sequence gap-filling even without an advertised count.
    #[arg(long)]
    no_sequence_require_upper_bound: bool,
    #[arg(long)]
    sequence_probe_after_upper_bound: bool,
    #[arg(long)]
    max_requests_per_sec: Option<f64>,
    #[arg(long)]
    max_burst: Option<u32>,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long, default_value = "data/state.sqlite3")]
    state_db: PathBuf,
    /// Job id; the latest job when omitted.
    #[arg(long)]
    job_id: Option<String>,
    /// Number of recent events to include.
    #[arg(long, default_value_t = 20)]
    events: i64,
}

#[derive(Args)]
struct RetryArgs {
    #[arg(long, default_value = "data/state.sqlite3")]
    state_db: PathBuf,
    #[arg(long)]
    job_id: Option<String>,
    /// Cap on how many failed images to retry.
    #[arg(long)]
    limit: Option<i64>,
    #[arg(long)]
    image_timeout_sec: Option<f64>,
    #[arg(long)]
    image_retries: Option<u32>,
    #[arg(long)]
    request_delay_sec: Option<f64>,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long, default_value = "data/state.sqlite3")]
    state_db: PathBuf,
    #[arg(long)]
    job_id: Option<String>,
    /// Destination path of the summary JSON.
    #[arg(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("html5ever=warn".parse()?)
        .add_directive("selectors=warn".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args),
        Command::RetryFailed(args) => retry_failed(args).await,
        Command::Export(args) => export(args),
    }
}

fn build_config(args: RunArgs) -> Result<RunConfig> {
    let mut config = RunConfig::new(args.url_template, args.start_num);
    config.end_num = args.end_num;
    if let Some(selector) = args.selector {
        config.selector = selector;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(state_db) = args.state_db {
        config.state_db = state_db;
    }
    if let Some(engine) = args.engine {
        config.engine = engine.parse()?;
    }
    config.resume = !args.no_resume;
    if let Some(value) = args.page_timeout_sec {
        config.page_timeout_sec = value;
    }
    if let Some(value) = args.image_timeout_sec {
        config.image_timeout_sec = value;
    }
    if let Some(value) = args.image_retries {
        config.image_retries = value;
    }
    if let Some(value) = args.page_retries {
        config.page_retries = value;
    }
    if let Some(value) = args.request_delay_sec {
        config.request_delay_sec = value;
    }
    if let Some(value) = args.stop_after_consecutive_page_failures {
        config.stop_after_consecutive_page_failures = value;
    }
    config.playwright_fallback = args.playwright_fallback;
    if let Some(selector) = args.sequence_count_selector {
        config.sequence_count_selector = selector;
    }
    config.sequence_require_upper_bound = !args.no_sequence_require_upper_bound;
    config.sequence_probe_after_upper_bound = args.sequence_probe_after_upper_bound;
    if let Some(value) = args.max_requests_per_sec {
        config.max_requests_per_sec = value;
    }
    if let Some(value) = args.max_burst {
        config.max_burst = value;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(args)?;
    if config.engine == Engine::Playwright {
        bail!("the browser engine is not bundled with this binary; use `--engine requests`");
    }
    if config.playwright_fallback {
        tracing::warn!("No fallback fetcher is bundled; --playwright-fallback has no effect here");
    }

    let job_id = config.job_id();
    let config_json = config.as_json()?;
    let store = StateStore::open(&config.state_db)?;
    let fetcher = HttpFetcher::new()?;
    let downloader = HttpDownloader::new(config.max_requests_per_sec, config.max_burst)?;
    let mut pipeline =
        HarvestPipeline::new(config, store, Box::new(fetcher), Box::new(downloader));

    let stats = pipeline.run(&job_id, &config_json).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn status(args: StatusArgs) -> Result<()> {
    let mut store = StateStore::open(&args.state_db)?;
    let job = resolve_job(&mut store, args.job_id)?;
    let stats = store.stats_for_job(&job)?;
    let events = store.list_events(&job, args.events)?;
    let payload = serde_json::json!({ "stats": stats, "events": events });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn retry_failed(args: RetryArgs) -> Result<()> {
    let mut store = StateStore::open(&args.state_db)?;
    let job_id = resolve_job(&mut store, args.job_id)?;
    let job = store
        .get_job(&job_id)?
        .with_context(|| format!("job {} not found", job_id))?;
    let config: RunConfig = serde_json::from_str(&job.config_json)
        .with_context(|| format!("stored config of job {} is unreadable", job_id))?;

    let fetcher = HttpFetcher::new()?;
    let downloader = HttpDownloader::new(config.max_requests_per_sec, config.max_burst)?;
    let mut pipeline =
        HarvestPipeline::new(config, store, Box::new(fetcher), Box::new(downloader));
    let summary = pipeline
        .retry_failed(
            &job_id,
            args.limit,
            args.image_timeout_sec,
            args.image_retries,
            args.request_delay_sec,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn export(args: ExportArgs) -> Result<()> {
    let mut store = StateStore::open(&args.state_db)?;
    let job_id = resolve_job(&mut store, args.job_id)?;
    let job = store
        .get_job(&job_id)?
        .with_context(|| format!("job {} not found", job_id))?;
    let config: RunConfig = serde_json::from_str(&job.config_json)
        .with_context(|| format!("stored config of job {} is unreadable", job_id))?;

    let fetcher = HttpFetcher::new()?;
    let downloader = HttpDownloader::new(config.max_requests_per_sec, config.max_burst)?;
    let mut pipeline =
        HarvestPipeline::new(config, store, Box::new(fetcher), Box::new(downloader));
    let path = pipeline.export_job_metadata(&job_id, &args.output)?;
    println!("{}", path.display());
    Ok(())
}

fn resolve_job(store: &mut StateStore, job_id: Option<String>) -> Result<String> {
    match job_id {
        Some(job_id) => Ok(job_id),
        None => Ok(store
            .get_latest_job()?
            .context("no jobs found in the state database")?
            .job_id),
    }
}
