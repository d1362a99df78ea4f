//! CLI argument definitions using clap
//!
//! Commands:
//! - shardexec run --plan <path> --rows <path> [--config <path>] [--shard <index>:<id>]
//! - shardexec validate --plan <path> [--config <path>] [--shard <index>:<id>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// shardexec - streaming projector execution over an in-memory cluster
#[derive(Parser, Debug)]
#[command(name = "shardexec")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a projection plan over a JSON row file
    Run {
        /// JSON array of projections
        #[arg(long)]
        plan: PathBuf,

        /// JSON array of rows, each a JSON array of column values
        #[arg(long)]
        rows: PathBuf,

        /// Execution settings file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shard the chain runs on, as <index>:<id>
        #[arg(long)]
        shard: Option<String>,

        /// Nodes of the local cluster
        #[arg(long, default_value_t = 1)]
        nodes: usize,

        /// Shards per index of the local cluster
        #[arg(long, default_value_t = 1)]
        shards: u32,

        /// Index to create before execution (repeatable)
        #[arg(long = "index")]
        indices: Vec<String>,
    },

    /// Compile a projection plan and exit
    Validate {
        /// JSON array of projections
        #[arg(long)]
        plan: PathBuf,

        /// Execution settings file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shard the chain would run on, as <index>:<id>
        #[arg(long)]
        shard: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
