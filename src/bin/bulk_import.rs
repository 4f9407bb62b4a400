use std::path::PathBuf;

use anyhow::Result;
use bulk_import::cli::import::{self, CheckConfig, ImportConfig, ImportStep};
use bulk_import::util::env;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "bulk-import",
    version,
    about = "Load CSV files into SQLite through JSON mappings"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run import steps in order; a failing step stops the run
    Run {
        /// Database file (defaults to IMPORT_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Import step as <mapping.json>=<data.csv>; repeatable
        #[arg(long = "step", required = true)]
        steps: Vec<ImportStep>,
        /// Rows per statement for every step (defaults to the mapping, then IMPORT_FLUSH_LIMIT)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Verify mappings against the database schema without writing
    Check {
        /// Database file (defaults to IMPORT_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Mapping file; repeatable
        #[arg(long = "mapping", required = true)]
        mappings: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    env::init_env();
    bulk_import::tracing::init_tracing(bulk_import::tracing::DEFAULT_FILTER)?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { db, steps, limit } => {
            let summaries = import::run(ImportConfig {
                db_path: db,
                steps,
                limit,
            })?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Commands::Check { db, mappings } => {
            import::check(CheckConfig {
                db_path: db,
                mappings,
            })?;
        }
    }
    Ok(())
}
