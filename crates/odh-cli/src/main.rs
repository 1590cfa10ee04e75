use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use odh_core::{AggregationSummary, RunStatus, RunSummary};
use odh_sync::{CancellationToken, HarvestConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "odh-cli")]
#[command(about = "Open data harvester: harvest catalogs, aggregate duplicates, feed the search index")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest sources, then aggregate everything they touched.
    Harvest {
        /// Only harvest these sources (repeatable). Defaults to every enabled source.
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long)]
        skip_aggregate: bool,
    },
    /// Rebuild index entries from stored records.
    Aggregate {
        /// Only buckets touching these sources (repeatable). Defaults to every bucket.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    Migrate,
    /// Hard-delete records retracted more than N days ago.
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ODH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn print_run(run: &RunSummary) {
    println!(
        "harvest {}: run_id={} status={:?} processed={} skipped={} invalid={} warnings={} errors={}",
        run.source_id,
        run.run_id,
        run.status,
        run.counts.processed,
        run.counts.skipped,
        run.counts.invalid,
        run.counts.warnings,
        run.counts.errors,
    );
}

fn print_aggregation(summary: &AggregationSummary) {
    println!(
        "aggregate: buckets={} indexed={} deleted={} removed_records={} bucket_errors={} index_errors={}",
        summary.buckets,
        summary.indexed,
        summary.deleted,
        summary.removed_records,
        summary.bucket_errors.len(),
        summary.index_errors.len(),
    );
}

/// Cancels `token` on the first Ctrl-C; running jobs roll back and report `Cancelled`.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling running harvest jobs");
            token.cancel();
        }
    });
}

async fn harvest(pipeline: &SyncPipeline, sources: &[String], skip_aggregate: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let runs = if sources.is_empty() && !skip_aggregate {
        let report = pipeline.run_all(Utc::now(), &cancel).await?;
        report.runs.iter().for_each(print_run);
        match &report.aggregation {
            Some(summary) => print_aggregation(summary),
            None => info!("aggregation skipped"),
        }
        report.runs
    } else {
        let runs = pipeline.harvest_sources(sources, Utc::now(), &cancel).await?;
        runs.iter().for_each(print_run);
        if skip_aggregate || cancel.is_cancelled() {
            info!("aggregation skipped");
        } else {
            print_aggregation(&pipeline.aggregate_sources(sources).await?);
        }
        runs
    };

    let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
    if failed > 0 {
        bail!("{failed} of {} harvest runs failed", runs.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Harvest {
        sources: Vec::new(),
        skip_aggregate: false,
    });

    let pipeline = SyncPipeline::connect(HarvestConfig::from_env()?).await?;
    let result = match command {
        Commands::Harvest {
            sources,
            skip_aggregate,
        } => harvest(&pipeline, &sources, skip_aggregate).await,
        Commands::Aggregate { sources } => pipeline
            .aggregate_sources(&sources)
            .await
            .map(|summary| print_aggregation(&summary)),
        Commands::Migrate => pipeline.migrate().await.map(|()| println!("migrations applied")),
        Commands::Purge { older_than_days } => pipeline
            .purge(older_than_days)
            .await
            .map(|purged| println!("purged {purged} retracted records")),
    };
    pipeline.close().await;
    result
}
