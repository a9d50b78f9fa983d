//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download files with resume, retry and progress.
///
/// URLs are taken from the arguments, or one per line from stdin when none
/// are given. Interrupted downloads resume from the partial file on the next
/// run with the same URL and destination.
#[derive(Parser, Debug)]
#[command(name = "kdownload")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Destination folder (relative folders resolve under the download directory)
    #[arg(short = 'o', long, default_value = "")]
    pub folder: String,

    /// File name to save as (only valid with a single URL)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Extra request header, e.g. -H "Authorization: Bearer token" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Keep existing files and save under "name (n).ext" instead of replacing
    #[arg(long)]
    pub allow_duplicate: bool,

    /// Maximum retries after the first attempt (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Parses `Name: value` into a header pair.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(format!("expected 'Name: value', got '{raw}'"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}
