use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plet_core::{RunSummary, SourceType};
use plet_sync::{IngestOptions, IngestPipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "plet-cli")]
#[command(about = "PLET command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the bill registry and materialize new stage evidence.
    Ingest {
        /// Restrict to one parliamentary session number.
        #[arg(long)]
        session: Option<u32>,
        /// Process at most this many bills.
        #[arg(long)]
        limit: Option<usize>,
        /// Reprocess bills even when no new activity is detected.
        #[arg(long)]
        force: bool,
        /// Compute and log every decision, but write nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Feed a JSON array of raw news or regulatory-notice items through
    /// normalize -> match -> commit.
    IngestFile {
        /// Source type of the items: news or regulatory-notice.
        #[arg(long)]
        source: SourceType,
        /// Path to a JSON array of raw payloads.
        path: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print briefs for the most recent runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingest complete: run_id={} source={} processed={} updated={} skipped={} errors={}{}",
        summary.run_id,
        summary.source,
        summary.processed,
        summary.updated,
        summary.skipped,
        summary.errors,
        if summary.dry_run { " (dry run)" } else { "" }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            session,
            limit,
            force,
            dry_run,
        } => {
            let options = IngestOptions {
                session,
                limit,
                force,
                dry_run,
            };
            let summary = plet_sync::run_bill_ingest_from_env(&options).await?;
            print_summary(&summary);
        }
        Commands::IngestFile {
            source,
            path,
            dry_run,
        } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let items: Vec<serde_json::Value> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {} as a JSON array", path.display()))?;
            let config = PipelineConfig::from_env();
            let pipeline = IngestPipeline::from_config(&config).await?;
            let summary = pipeline.run_items(source, &items, dry_run).await?;
            print_summary(&summary);
        }
        Commands::Report { runs } => {
            let markdown = plet_sync::report_recent_markdown(runs, None)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
