use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pmsync")]
#[command(about = "Reconcile the Airtable base into the database or the shared spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full-replace import of contacts, projects, purchases and static info into Postgres.
    MigrateDb,
    /// Rebuild one spreadsheet tab per registered table.
    SyncSheets,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::MigrateDb => {
            warn!("migrate-db deletes every imported row before re-importing");
            let summary = pmsync_sync::run_database_migration_from_env().await?;
            println!("database migration complete: run_id={}", summary.run_id);
            for line in summary.render_lines() {
                println!("  {line}");
            }
        }
        Commands::SyncSheets => {
            let summary = pmsync_sync::run_sheet_sync_from_env().await?;
            println!("spreadsheet sync complete: run_id={}", summary.run_id);
            for line in summary.render_lines() {
                println!("  {line}");
            }
        }
    }

    Ok(())
}
