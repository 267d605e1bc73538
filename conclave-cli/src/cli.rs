//! Argument parsing for the embedding example binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "conclave", about = "Terminal session over the Conclave agent runtime")]
pub struct Args {
    /// Path to a TOML config file overriding the defaults in `spec.md` §6.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Session id to register with the agent manager for this terminal run.
    #[arg(long, default_value = "local")]
    pub session: String,

    /// Require explicit approval before any tool runs, overriding the config file.
    #[arg(long)]
    pub require_approval: bool,
}
