use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, the feature database and the model cache
    #[clap(long, global = true, env = "PHOTO_SEARCH_BASE_PATH")]
    pub base_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Bring the feature database in line with the photo library.
    Scan {
        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },

    /// Search photos by keyword.
    /// Scans the library first.
    Search {
        /// One search per keyword
        #[clap(required = true)]
        keywords: Vec<String>,

        /// Max number of results per keyword
        #[clap(short, long)]
        limit: Option<usize>,

        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },
}
