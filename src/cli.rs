//! Command-line interface definitions for habr_digest.
//!
//! Global options can also come from environment variables, which is how the
//! service is usually configured when run under a supervisor.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for habr_digest.
///
/// # Examples
///
/// ```sh
/// # Run the scheduler and read `news <caller> [hours]` commands from stdin
/// habr_digest --config config.yaml serve
///
/// # One-off harvest of two hubs over the last 6 hours, printed as JSON
/// habr_digest harvest --hub Python --hub Linux --hours 6
///
/// # List configured hubs
/// habr_digest hubs
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long, env = "HABR_DIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory digests are written to; overrides `output_dir` in the config
    #[arg(short, long, env = "HABR_DIGEST_OUTPUT")]
    pub output_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run scheduled harvests and serve on-demand commands from stdin
    Serve,

    /// Harvest hubs once and print the articles as JSON
    Harvest {
        /// Hub display name; repeat for several hubs
        #[arg(long = "hub", required = true)]
        hubs: Vec<String>,

        /// Lookback window in hours (1 to 24)
        #[arg(long, default_value_t = 1)]
        hours: u32,
    },

    /// List configured hubs and their slugs
    Hubs,
}
