use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use placesync_sync::{CycleStatus, SyncRunSummary, SyncSelection};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "placesync-cli")]
#[command(about = "Sync Google place reviews and opening hours into Strapi")]
struct Cli {
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reviews, then opening hours.
    Sync,
    Reviews,
    OpeningHours,
}

impl Commands {
    fn selection(&self) -> SyncSelection {
        match self {
            Commands::Sync => SyncSelection::All,
            Commands::Reviews => SyncSelection::Reviews,
            Commands::OpeningHours => SyncSelection::OpeningHours,
        }
    }
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync finished: run_id={} place_id={} strategy={:?}",
        summary.run_id, summary.place_id, summary.cutoff_strategy
    );
    for cycle in &summary.cycles {
        let status = match &cycle.status {
            CycleStatus::Completed => "completed".to_string(),
            CycleStatus::Skipped => "skipped".to_string(),
            CycleStatus::Aborted { reason } => format!("aborted ({reason})"),
        };
        let cutoff = cycle
            .cutoff_after
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}: {status} fetched={} created={} updated={} rejected={} dropped={} cutoff={cutoff}",
            cycle.entity, cycle.fetched, cycle.created, cycle.updated, cycle.rejected, cycle.dropped
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync);

    let summary = placesync_sync::run_sync_once_from_env(command.selection()).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if !summary.is_success() {
        tracing::error!(run_id = %summary.run_id, "sync run finished with aborted cycles");
        bail!("one or more sync cycles aborted");
    }
    Ok(())
}
