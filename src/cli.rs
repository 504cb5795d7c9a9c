//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Accelerated downloader: multi-connection transfers with resume.
///
/// Splits each file across several concurrent byte-range connections,
/// survives crashes via on-disk segment snapshots, and verifies
/// checksums when one is supplied.
#[derive(Parser, Debug)]
#[command(name = "accel")]
#[command(author, version, about)]
#[command(
    after_help = "Exit codes:\n  0 = download completed\n  1 = download failed\n  2 = fatal error"
)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_precedence_over_arg = true)]
pub struct Cli {
    /// Optional top-level command namespace.
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub download: DownloadArgs,
}

/// Top-level command namespaces.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List catalog entries and their status.
    List,
    /// Resume a paused or errored download by ID.
    Resume(ResumeArgs),
    /// Remove an entry by ID.
    Remove(RemoveArgs),
    /// Probe a URL without downloading.
    Probe(ProbeArgs),
}

/// Arguments for the default download action.
#[derive(ClapArgs, Debug, Clone)]
pub struct DownloadArgs {
    /// URL to download (http, https, or ftp).
    pub url: Option<String>,

    /// Output directory.
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Target file name (derived from the server when omitted).
    #[arg(long, value_name = "NAME")]
    pub file_name: Option<String>,

    /// Connection count (1-32).
    #[arg(short = 'n', long, value_name = "N")]
    pub connections: Option<u32>,

    /// Global rate cap in bytes per second (0 = unlimited).
    #[arg(long, value_name = "BPS", default_value_t = 0)]
    pub rate_limit: u64,

    /// Referrer header.
    #[arg(long, value_name = "URL")]
    pub referrer: Option<String>,

    /// Cookie header (`name=value; name2=value2`).
    #[arg(long, value_name = "COOKIES")]
    pub cookies: Option<String>,

    /// Expected checksum as hex.
    #[arg(long, value_name = "HEX", requires = "checksum_type")]
    pub checksum: Option<String>,

    /// Checksum algorithm: md5, sha1, or sha256.
    #[arg(long, value_name = "ALGO")]
    pub checksum_type: Option<String>,

    /// Data directory for the catalog and state files.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Suppress progress output.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for `accel resume`.
#[derive(ClapArgs, Debug)]
pub struct ResumeArgs {
    /// Download ID (see `accel list`).
    pub id: String,

    /// Suppress progress output.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for `accel remove`.
#[derive(ClapArgs, Debug)]
pub struct RemoveArgs {
    /// Download ID (see `accel list`).
    pub id: String,

    /// Also delete the downloaded file and partials.
    #[arg(long)]
    pub delete_files: bool,
}

/// Arguments for `accel probe`.
#[derive(ClapArgs, Debug)]
pub struct ProbeArgs {
    /// URL to probe.
    pub url: String,
}
