use crate::data::models::EntityType;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Canonicalize show metadata and match local records against an external
/// catalog.
#[derive(Parser, Debug)]
#[command(name = "canonry", author, version = env!("GIT_COMMIT_SHORT"), about, long_about = None)]
pub struct Args {
    /// Log formatting: pretty for terminals, json for log shippers.
    #[arg(long, value_enum, global = true, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Configuration file (defaults to ./canonry.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Match a file of local records against the catalog
    Run(RunArgs),
    /// Resolve one raw string through the alias index
    Resolve {
        #[arg(long, value_enum)]
        entity_type: EntityType,
        text: String,
        /// Alias seed file, used when no database is configured
        #[arg(long)]
        aliases: Option<PathBuf>,
    },
    /// Parse a free-text credits string into structured entries
    ParseCredits {
        text: String,
        /// Identifier included in parse warnings
        #[arg(long, default_value = "cli")]
        show: String,
        #[arg(long)]
        aliases: Option<PathBuf>,
    },
    /// Register an unresolved string as an alias of an existing entity
    /// (requires a database)
    Promote {
        #[arg(long, value_enum)]
        entity_type: EntityType,
        #[arg(long)]
        entity_id: i32,
        text: String,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// JSON array of local records
    #[arg(long)]
    pub records: PathBuf,
    /// Alias seed file; merged over database aliases when both are present
    #[arg(long)]
    pub aliases: Option<PathBuf>,
    /// Skip records that already have an accepted match
    #[arg(long)]
    pub resume: bool,
    /// Write the JSON report here instead of stdout
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable, colored when attached to a terminal
    Pretty,
    /// One JSON object per event
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
