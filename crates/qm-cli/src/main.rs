use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use qm_pipeline::{PipelineConfig, QuotePipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qm-cli")]
#[command(about = "Quote metadata pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape quote pages for the given comma-separated URLs.
    Scrape {
        #[arg(long)]
        urls: String,
        #[arg(long, default_value = "quotes")]
        prefix: String,
    },
    /// Structure a raw scrape CSV by author.
    Structure {
        #[arg(long)]
        input: PathBuf,
    },
    /// Sanitize, assign identifiers, and submit the generation batch.
    Prepare {
        #[arg(long)]
        input: PathBuf,
    },
    /// Poll a submitted batch and publish its results when completed.
    Fetch {
        #[arg(long)]
        tracking: PathBuf,
    },
    /// Merge generated metadata back into the identified table.
    Merge {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        results: PathBuf,
    },
    /// Print the sorted distinct author list of a table.
    Authors {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let pipeline = QuotePipeline::new(PipelineConfig::from_env())?;

    match cli.command {
        Commands::Scrape { urls, prefix } => {
            let summary = pipeline.run_scrape(&urls, &prefix).await?;
            println!(
                "scrape complete: run_id={} slugs={} rows={} artifact={}",
                summary.run_id, summary.slugs, summary.rows, summary.artifact
            );
        }
        Commands::Structure { input } => {
            let summary = pipeline.run_structure(&input).await?;
            println!(
                "structure complete: run_id={} records={} artifact={}",
                summary.run_id, summary.records, summary.artifact
            );
        }
        Commands::Prepare { input } => {
            let summary = pipeline.run_prepare(&input).await?;
            println!(
                "prepare complete: run_id={} clean={} removed={} requests={} batch_id={} tracking={}",
                summary.run_id,
                summary.clean_rows,
                summary.removed_rows,
                summary.requests,
                summary.batch_id,
                summary.tracking_json
            );
        }
        Commands::Fetch { tracking } => {
            let summary = pipeline.run_fetch(&tracking).await?;
            if summary.completed {
                println!(
                    "batch {} completed: results={} signed_url={}",
                    summary.batch_id,
                    summary.results_artifact.unwrap_or_default(),
                    summary.signed_url.unwrap_or_default()
                );
            } else {
                println!(
                    "batch {} not ready yet: status={}",
                    summary.batch_id, summary.status
                );
            }
        }
        Commands::Merge { table, results } => {
            let summary = pipeline.run_merge(&table, &results).await?;
            println!(
                "merge complete: run_id={} rows={} matched={} artifact={}",
                summary.run_id, summary.rows, summary.matched_rows, summary.artifact
            );
        }
        Commands::Authors { input } => {
            println!("{}", pipeline.run_authors(&input).await?);
        }
    }

    Ok(())
}
