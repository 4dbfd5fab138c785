use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_core::{parse_collection_ids, CollectionId};
use roster_storage::encode_snapshot;
use roster_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Merge event participant listings into the shared roster snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge with the stored snapshot, and upload the result.
    Sync {
        #[command(flatten)]
        ids: IdsArgs,
        #[arg(long)]
        snapshot_path: Option<String>,
        /// Reconcile and print the merged snapshot without uploading it.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Fetch participants only and print them as CSV.
    Fetch {
        #[command(flatten)]
        ids: IdsArgs,
    },
    /// Print the snapshot currently in the store.
    Show {
        #[arg(long)]
        snapshot_path: Option<String>,
    },
}

#[derive(Debug, Args)]
struct IdsArgs {
    /// Collection (event) ids; commas or newlines separate several.
    ids: Vec<String>,
    /// Read collection ids from a file in the same free-text format.
    #[arg(long)]
    ids_file: Option<PathBuf>,
}

impl IdsArgs {
    fn collection_ids(&self) -> Result<Vec<CollectionId>> {
        let mut text = self.ids.join("\n");
        if let Some(path) = &self.ids_file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            text.push('\n');
            text.push_str(&contents);
        }
        Ok(parse_collection_ids(&text))
    }
}

fn print_csv(records: &[roster_core::ParticipationRecord]) -> Result<()> {
    let bytes = encode_snapshot(records).context("encoding records")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("writing to stdout")?;
    stdout.flush().context("flushing stdout")
}

fn print_summary(summary: &SyncRunSummary) {
    for aborted in summary.aborted_collections() {
        eprintln!(
            "warning: collection {} stopped early after {} page(s); kept {} record(s)",
            aborted.collection_id, aborted.pages_requested, aborted.records
        );
    }
    println!(
        "sync complete: run_id={} collections={} fetched={} existing={} merged={} uploaded={}",
        summary.run_id,
        summary.collections.len(),
        summary.fetched_records,
        summary.existing_records,
        summary.merged_records,
        match (&summary.uploaded_bytes, &summary.snapshot_sha256) {
            (Some(bytes), Some(sha)) => format!("{}:{bytes}B sha256={sha}", summary.snapshot_path),
            _ => "no (dry run)".to_string(),
        }
    );
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            ids,
            snapshot_path,
            dry_run,
            json,
        } => {
            if let Some(path) = snapshot_path {
                config.snapshot_path = path;
            }
            config.dry_run |= dry_run;
            let collection_ids = ids.collection_ids()?;
            let summary = SyncPipeline::new(config)?.run_once(&collection_ids).await?;
            if json {
                let rendered =
                    serde_json::to_string_pretty(&summary).context("serializing summary")?;
                println!("{rendered}");
            } else {
                print_summary(&summary);
            }
            if summary.dry_run && !json {
                print_csv(&summary.snapshot)?;
            }
        }
        Commands::Fetch { ids } => {
            let collection_ids = ids.collection_ids()?;
            if collection_ids.is_empty() {
                anyhow::bail!("no numeric collection ids were given");
            }
            let pipeline = SyncPipeline::new(config)?;
            let outcomes = pipeline.fetch(&collection_ids).await;
            let records: Vec<_> = outcomes.into_iter().flat_map(|o| o.records).collect();
            eprintln!("fetched {} record(s)", records.len());
            print_csv(&records)?;
        }
        Commands::Show { snapshot_path } => {
            if let Some(path) = snapshot_path {
                config.snapshot_path = path;
            }
            let records = SyncPipeline::new(config)?.current_snapshot().await?;
            print_csv(&records)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
