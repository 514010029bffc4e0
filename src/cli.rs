use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the chapter listing for a book.
    Info(InfoArgs),
    /// Acquire every chapter of a book through a driven browser.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Book id as it appears in the reader URL.
    #[arg(long)]
    pub book_id: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Book id as it appears in the reader URL.
    #[arg(long)]
    pub book_id: String,

    /// Output directory for chapter files and book metadata.
    #[arg(long)]
    pub out: PathBuf,

    /// Cookie file holding the session (JSON object or `k=v; k=v`).
    #[arg(long, default_value = "cache/cookie.txt")]
    pub cookie: PathBuf,

    /// Directory for cached static assets.
    #[arg(long, default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Run the browser without a visible window. Interactive login needs a
    /// visible window, so this is only useful with a valid cookie file.
    #[arg(long)]
    pub headless: bool,

    /// Discard any stored session and log in from scratch.
    #[arg(long)]
    pub force_login: bool,

    /// Per-chapter navigation timeout.
    #[arg(long, default_value_t = 60)]
    pub nav_timeout_secs: u64,

    /// Minimum chapter turnaround, measured from navigation start.
    #[arg(long, default_value_t = 2000)]
    pub min_interval_ms: u64,

    /// Attempts per chapter before the run is abandoned.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}
