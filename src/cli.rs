//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use netdisk_core::TransferMode;

/// Download files from a cloud drive with a durable history.
///
/// Netdisk fetches shared links with your signed-in session cookies, shows
/// live progress and remembers every download.
#[derive(Parser, Debug)]
#[command(name = "netdisk")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// History database file
    #[arg(long, value_name = "FILE", global = true)]
    pub database: Option<PathBuf>,

    /// Directory downloads are written into
    #[arg(short = 'o', long, value_name = "DIR", global = true)]
    pub download_dir: Option<PathBuf>,

    /// Transfer backend: streamed (in-process) or delegated (background service)
    #[arg(short = 'm', long, value_name = "MODE", global = true)]
    pub mode: Option<TransferMode>,

    /// Netscape-format cookie file to authenticate with
    #[arg(long, value_name = "FILE", global = true)]
    pub cookies: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Download a URL and follow its progress
    Get {
        /// Link to download
        url: String,

        /// Name to save as (derived from the URL when omitted)
        #[arg(short = 'f', long)]
        filename: Option<String>,

        /// Do not draw a progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show the download history, most recent first
    List,

    /// Delete a download from the history, cancelling it if still running
    Remove {
        /// Download id as shown by `list`
        id: u64,
    },

    /// Delete the whole download history
    Clear,

    /// Store a session cookie for a drive
    Login {
        /// Raw `Cookie` header value, e.g. "BDUSS=...; STOKEN=..."
        #[arg(long)]
        cookie: String,

        /// Drive URL the cookie belongs to
        #[arg(long)]
        url: String,
    },

    /// Forget the stored session cookie
    Logout,
}
