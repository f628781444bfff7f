//! CLI argument definitions using clap derive macros.
//!
//! Tunables are `Option`s so values from the config file apply when a flag is
//! absent; see `app_config::Settings::resolve`.

use std::path::PathBuf;

use clap::Parser;

/// Localize images referenced by Markdown documents.
///
/// Every remote image in the input documents is downloaded once, optimized,
/// and stored locally; rewritten copies of the documents point at the local
/// files. Images that cannot be fetched become clickable placeholders.
#[derive(Parser, Debug)]
#[command(name = "imgsync")]
#[command(author, version, about)]
pub struct Args {
    /// Markdown file or directory of Markdown files
    pub input: PathBuf,

    /// Directory for rewritten documents [default: imgsync-out]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for downloaded assets [default: <output>/assets]
    #[arg(long)]
    pub asset_dir: Option<PathBuf>,

    /// Directory for cache records [default: .imgsync-cache]
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Prefix placed before asset file names in rewritten links [default: assets/]
    #[arg(long)]
    pub link_prefix: Option<String>,

    /// Images acquired concurrently per document (1-50)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=50))]
    pub concurrency: Option<u8>,

    /// Attempts per image, including the first (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: Option<u32>,

    /// Deadline for one download attempt in seconds (1-600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub attempt_timeout: Option<u64>,

    /// Images wider than this are scaled down (16-16384)
    #[arg(long, value_parser = clap::value_parser!(u32).range(16..=16384))]
    pub max_width: Option<u32>,

    /// JPEG re-encode quality (30-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(30..=100))]
    pub jpeg_quality: Option<u8>,

    /// Documents fetched per second (1-100)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=100))]
    pub documents_per_second: Option<u64>,

    /// Append failed references to this JSON file
    #[arg(long)]
    pub failure_log: Option<PathBuf>,

    /// Read defaults from this file instead of the user config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
