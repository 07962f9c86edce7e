use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Multi-agent workflow orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a workflow from a definition file
    Run {
        /// Workflow definition (TOML)
        #[arg(short, long)]
        workflow: PathBuf,

        /// Model for agents that don't override it
        #[arg(short, long)]
        model: Option<String>,

        /// Working directory agents operate in
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Maximum concurrently running agents (0 = unlimited)
        #[arg(long)]
        max_agents: Option<i64>,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to persist orchestrator snapshots
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Approve every phase gate without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Reload a snapshot and recover agents interrupted by a restart
    Resume {
        /// Snapshot written by a previous run
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Approve every phase gate without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Parse a workflow definition and print its phase plan
    Validate {
        /// Workflow definition (TOML)
        #[arg(short, long)]
        workflow: PathBuf,
    },
}
