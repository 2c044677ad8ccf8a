//! Command-line surface. Subcommand parsing only; each subcommand's
//! handler lives in `main.rs` alongside wiring for the clients it needs.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shelfbridge", about = "Projects Audiobookshelf reading progress onto Hardcover")]
pub struct Cli {
    #[arg(long, global = true, env = "SHELFBRIDGE_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single sync pass across all configured users.
    Sync {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        skip_validation: bool,
    },
    /// Run the cron scheduler loop.
    Start,
    /// Dump the raw shape of a user's ABS library without writing anything.
    Debug {
        #[arg(long)]
        user: Option<String>,
    },
    /// Validate configuration without contacting ABS or Hardcover.
    Validate,
    /// Inspect or reset the local cache.
    Cache {
        #[arg(long)]
        show: bool,
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        export: Option<PathBuf>,
        #[arg(long)]
        stats: bool,
    },
    /// Interactive prompt-driven session.
    Interactive,
}
