//! CLI parse: clap types for gamewiki. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// GameWiki assistant - wiki lookups and guide answers for the game you are playing
#[derive(Parser)]
#[command(name = "gamewiki")]
#[command(about = "Ask wiki and guide questions about the game you are playing")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (where config/ lives)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a question
    Ask {
        /// The question
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Title of the game window the question is about
        #[arg(long)]
        window: Option<String>,
        /// Routing mode (auto, wiki, ai)
        #[arg(long, default_value = "auto")]
        mode: String,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List the configured site mappings
    Sites {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Validate configuration and report credential and index status
    Check,
}
