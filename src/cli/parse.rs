//! CLI parse: clap types for Storyboard. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Storyboard CLI - batch illustration generation
#[derive(Parser)]
#[command(name = "storyboard")]
#[command(about = "Generate illustrations for a batch of scenes through an image provider")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (layered over the global config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable logging (default: off)
    #[arg(long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a batch file, wait for it to settle and write the images
    Run {
        /// Batch file (TOML)
        batch_file: PathBuf,
        /// Provider to use instead of the one named in the batch file
        #[arg(long)]
        provider: Option<String>,
        /// Override the batch's max_parallel
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Directory to write generated images to
        #[arg(long, default_value = "illustrations")]
        output: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Check a batch file without submitting it
    Validate {
        /// Batch file (TOML)
        batch_file: PathBuf,
    },
    /// List configured providers
    Providers {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}
