use std::path::PathBuf;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use stayscout_pipeline::{
    load_calendar_captures, load_run_payload, refresh_occupancy, IngestPipeline, RunConfig,
    SourceRegistry,
};
use stayscout_store::{ListingStore, PayloadArchive, SqliteListingStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stayscout")]
#[command(about = "Short-term stay listing ingestion and occupancy stats")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one extraction-run payload into the listing store.
    Ingest {
        /// Path to the run payload JSON produced by the fetcher.
        #[arg(long)]
        input: PathBuf,
    },
    /// Compute and persist forward-window occupancy from calendar captures.
    Occupancy {
        /// Path to the calendar captures JSON produced by the fetcher.
        #[arg(long)]
        input: PathBuf,
        /// Horizon start (defaults to the first of next month).
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Horizon end (defaults to start + configured horizon days).
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Print stored listings, active only unless --all.
    List {
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_env();
    let store = SqliteListingStore::open(&config.db_path).await?;

    match cli.command {
        Commands::Ingest { input } => {
            let payload = load_run_payload(&input)?;
            let mut pipeline =
                IngestPipeline::new(store).with_archive(PayloadArchive::new(&config.archive_dir));
            if let Ok(registry) = SourceRegistry::load(&config.registry_path) {
                pipeline = pipeline.with_registry(registry);
            }
            let summary = pipeline.run(&payload).await?;
            println!(
                "ingest complete: run_id={} sources={} upserted={} skipped={} retired={}",
                summary.run_id,
                summary.sources_processed,
                summary.listings_upserted,
                summary.snapshots_skipped,
                summary.listings_retired
            );
        }
        Commands::Occupancy { input, start, end } => {
            let captures = load_calendar_captures(&input)?;
            let (default_start, _) = config.default_horizon(Utc::now().date_naive());
            let horizon_start = start.unwrap_or(default_start);
            let horizon_end = end.unwrap_or_else(|| config.horizon_from(horizon_start).1);
            let results = refresh_occupancy(&store, &captures, horizon_start, horizon_end).await?;
            for (identity, stats) in &results {
                println!(
                    "{identity}: days={} booked={} open={} occupancy={} vacancy={}",
                    stats.forward_days,
                    stats.days_booked,
                    stats.days_not_booked,
                    format_pct(stats.occupancy_pct),
                    format_pct(stats.vacancy_pct)
                );
            }
            println!("occupancy refreshed for {} listings", results.len());
        }
        Commands::List { all } => {
            let records = if all {
                store.list_all().await?
            } else {
                store.list_active().await?
            };
            for record in &records {
                println!(
                    "{} {} rating={} reviews={} price/night={} active={} last_seen={}",
                    record.identity,
                    record.listing_url,
                    format_opt(record.rating),
                    format_opt(record.review_count),
                    format_opt(record.price_per_night),
                    record.active,
                    record.last_seen_at
                );
            }
            println!("{} listings", records.len());
        }
    }

    Ok(())
}

fn format_pct(value: Option<f64>) -> String {
    match value {
        Some(pct) => format!("{pct:.1}%"),
        None => "n/a".to_string(),
    }
}

fn format_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}
