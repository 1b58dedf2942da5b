use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use mof_analytics::{QueryService, DEFAULT_TOP_N};
use mof_core::{DateRange, LoadMode, RunSummary};
use mof_storage::Store;
use mof_sync::{runs_report_markdown, Loader, SyncConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mof")]
#[command(about = "Municipal Open-data Forensics command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull datasets from the open-data portal into the local store.
    Load {
        /// Dataset name from the registry; every dataset when omitted.
        dataset: Option<String>,
        /// Reload every year since the configured start year.
        #[arg(long, conflicts_with = "year")]
        full: bool,
        /// Reload a single year.
        #[arg(long)]
        year: Option<i32>,
        /// Rebuild from archived responses under ARTIFACTS_DIR instead of
        /// querying the portal.
        #[arg(long)]
        replay: bool,
    },
    /// Create or upgrade the store schema.
    Migrate,
    /// Print borough processing stats and scorecards for a year as JSON.
    Stats {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Print procurement forensics for a date range as JSON.
    Forensics {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        top: usize,
    },
    /// Show recent ingestion runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Serve the JSON API.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

fn print_summary(summary: &RunSummary) {
    let outcome = match &summary.outcome {
        mof_core::RunOutcome::Succeeded => "succeeded".to_string(),
        mof_core::RunOutcome::Failed { step, error } => format!("failed at {step}: {error}"),
    };
    println!(
        "load {}: run_id={} mode={} rows={} batches={} duration={:.1}s {outcome}",
        summary.dataset,
        summary.run_id,
        summary.mode.as_str(),
        summary.rows_loaded,
        summary.batches,
        summary.duration().as_secs_f64(),
    );
}

fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<DateRange> {
    match (from, to) {
        (Some(from), Some(to)) => Ok(DateRange::new(from, to)),
        (None, None) => DateRange::calendar_year(Utc::now().year()).context("current year out of range"),
        _ => bail!("--from and --to must be given together"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Load {
        dataset: None,
        full: false,
        year: None,
        replay: false,
    }) {
        Commands::Load {
            dataset,
            full,
            year,
            replay,
        } => {
            let mode = match (full, year) {
                (_, Some(year)) => LoadMode::Year(year),
                (true, None) => LoadMode::Full,
                (false, None) => LoadMode::Incremental,
            };
            let loader = Loader::from_config(&config).await?;
            let summaries = match (dataset, replay) {
                (Some(name), false) => vec![loader.load(&name, mode).await?],
                (Some(name), true) => vec![loader.replay(&name, mode).await?],
                (None, false) => loader.load_all(mode).await?,
                (None, true) => loader.replay_all(mode).await?,
            };
            summaries.iter().for_each(print_summary);
            if summaries.iter().any(|s| !s.succeeded()) {
                bail!("one or more loads failed; see `mof runs`");
            }
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema up to date: {}", config.database_url);
        }
        Commands::Stats { year } => {
            let store = Store::connect(&config.database_url).await?;
            let service = QueryService::new(store);
            let cards = service
                .request()
                .borough_scorecards(year.unwrap_or_else(|| Utc::now().year()))
                .await?;
            println!("{}", serde_json::to_string_pretty(&cards)?);
        }
        Commands::Forensics { from, to, top } => {
            let range = date_range(from, to)?;
            let store = Store::connect(&config.database_url).await?;
            let service = QueryService::new(store);
            let mut scope = service.request();
            let report = serde_json::json!({
                "range": range,
                "stats": scope.contract_stats(&range).await?,
                "thresholds": scope.threshold_clustering(&range).await?,
                "splits": scope.split_detection(&range, top).await?,
                "round_numbers": scope.round_numbers(&range).await?,
                "growth": scope.growth(&range, top).await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Runs { limit, dataset } => {
            let store = Store::connect(&config.database_url).await?;
            let runs = store.recent_runs(dataset.as_deref(), limit).await?;
            print!("{}", runs_report_markdown(&runs));
        }
        Commands::Serve => {
            mof_web::serve_from_env().await?;
        }
    }

    Ok(())
}
