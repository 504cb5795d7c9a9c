//! CLI entry point for the accel download engine.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use accel::download::{AddRequest, DownloadEngine, EngineEvent};
use accel::{DownloadStatus, EngineConfig};

mod cli;

use cli::{Cli, Command, DownloadArgs, ProbeArgs, RemoveArgs, ResumeArgs};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::from(ProcessExit::Fatal.code())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failed,
    Fatal,
}

impl ProcessExit {
    const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Fatal => 2,
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<ProcessExit> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::List) => run_list(&cli.download),
        Some(Command::Resume(args)) => run_resume(&cli.download, args).await,
        Some(Command::Remove(args)) => run_remove(&cli.download, args).await,
        Some(Command::Probe(args)) => run_probe(&cli.download, args).await,
        None => run_download(cli.download).await,
    }
}

/// Builds the engine from CLI-level settings.
fn build_engine(args: &DownloadArgs) -> Result<DownloadEngine> {
    let mut config = EngineConfig::default();

    if let Some(data_dir) = &args.data_dir {
        config.data_dir.clone_from(data_dir);
    } else if let Some(home) = dirs_data_dir() {
        config.data_dir = home;
    }
    if let Some(output) = &args.output {
        config.default_save_dir.clone_from(output);
    } else if let Ok(cwd) = std::env::current_dir() {
        config.default_save_dir = cwd;
    }
    config.rate_limit_bps = args.rate_limit;

    DownloadEngine::new(config).context("failed to start the download engine")
}

/// `~/.local/share/accel` (or the platform equivalent via HOME).
fn dirs_data_dir() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(|home| {
        std::path::PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("accel")
    })
}

async fn run_download(args: DownloadArgs) -> Result<ProcessExit> {
    let url = args
        .url
        .clone()
        .context("no URL given; see `accel --help`")?;

    let engine = build_engine(&args)?;

    let request = AddRequest {
        file_name: args.file_name.clone(),
        save_dir: args.output.clone(),
        referrer: args.referrer.clone(),
        cookies: args.cookies.clone(),
        num_connections: args.connections,
        checksum: match (&args.checksum, &args.checksum_type) {
            (Some(hex), Some(algo)) => Some((hex.clone(), algo.clone())),
            _ => None,
        },
        ..AddRequest::new(&url)
    };

    let id = engine.add(request)?;
    let outcome = drive_to_completion(&engine, &id, args.quiet).await?;
    engine.shutdown().await;
    Ok(outcome)
}

async fn run_resume(args: &DownloadArgs, resume: ResumeArgs) -> Result<ProcessExit> {
    let engine = build_engine(args)?;

    let entry = engine
        .get(&resume.id)
        .with_context(|| format!("no download with id {}", resume.id))?;
    debug!(id = %entry.id, status = entry.status.label(), "resuming");

    let outcome = drive_to_completion(&engine, &resume.id, resume.quiet).await?;
    engine.shutdown().await;
    Ok(outcome)
}

async fn run_remove(args: &DownloadArgs, remove: RemoveArgs) -> Result<ProcessExit> {
    let engine = build_engine(args)?;
    engine.remove(&remove.id, remove.delete_files).await?;
    engine.shutdown().await;
    println!("removed {}", remove.id);
    Ok(ProcessExit::Success)
}

async fn run_probe(args: &DownloadArgs, probe: ProbeArgs) -> Result<ProcessExit> {
    let engine = build_engine(args)?;
    let result = engine.probe(&probe.url).await;
    engine.shutdown().await;

    let probe = result?;
    println!("url:           {}", probe.info.final_url);
    println!("status:        {}", probe.info.status);
    println!(
        "size:          {}",
        format_size(probe.info.content_length)
    );
    println!("resumable:     {}", probe.info.accept_ranges);
    println!("content-type:  {}", probe.info.content_type);
    println!("suggested:     {}", probe.suggested_name);
    println!("category:      {}", probe.category);
    Ok(ProcessExit::Success)
}

fn run_list(args: &DownloadArgs) -> Result<ProcessExit> {
    let engine = build_engine(args)?;

    let entries = engine.list();
    if entries.is_empty() {
        println!("no downloads");
        return Ok(ProcessExit::Success);
    }

    for entry in entries {
        println!(
            "{}  {:<11}  {:>10}  {}",
            entry.id,
            entry.status.label(),
            format_size(entry.downloaded_bytes),
            entry.file_name
        );
    }
    Ok(ProcessExit::Success)
}

/// Starts a download and follows its event stream to a terminal state.
async fn drive_to_completion(
    engine: &DownloadEngine,
    id: &str,
    quiet: bool,
) -> Result<ProcessExit> {
    let mut events = engine.subscribe();
    engine.start(id)?;

    loop {
        match events.recv().await {
            Ok(EngineEvent::Progress {
                id: event_id,
                downloaded,
                total,
                speed,
            }) if event_id == id && !quiet => {
                if total > 0 {
                    let percent = downloaded as f64 / total as f64 * 100.0;
                    eprint!(
                        "\r{} / {}  ({percent:>5.1}%)  {}/s   ",
                        format_size(downloaded),
                        format_size(total),
                        format_size(speed as i64),
                    );
                } else {
                    eprint!(
                        "\r{}  {}/s   ",
                        format_size(downloaded),
                        format_size(speed as i64)
                    );
                }
            }
            Ok(EngineEvent::Complete { id: event_id }) if event_id == id => {
                let entry = engine.get(id);
                if !quiet {
                    eprintln!();
                }
                if let Some(entry) = entry {
                    if !entry.error_message.is_empty() {
                        eprintln!("warning: {}", entry.error_message);
                    }
                    println!("{}", entry.full_path().display());
                }
                return Ok(ProcessExit::Success);
            }
            Ok(EngineEvent::Error {
                id: event_id,
                message,
            }) if event_id == id => {
                if !quiet {
                    eprintln!();
                }
                eprintln!("download failed: {message}");
                return Ok(ProcessExit::Failed);
            }
            Ok(EngineEvent::Paused { id: event_id }) if event_id == id => {
                if !quiet {
                    eprintln!();
                }
                eprintln!("download paused");
                return Ok(ProcessExit::Failed);
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                // Engine went away; report whatever the catalog says.
                let status = engine.get(id).map(|e| e.status);
                return Ok(if status == Some(DownloadStatus::Complete) {
                    ProcessExit::Success
                } else {
                    ProcessExit::Failed
                });
            }
        }
    }
}

/// Human-readable byte count.
fn format_size(bytes: i64) -> String {
    if bytes < 0 {
        return "unknown".to_string();
    }
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProcessExit::Success.code(), 0);
        assert_eq!(ProcessExit::Failed.code(), 1);
        assert_eq!(ProcessExit::Fatal.code(), 2);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(-1), "unknown");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(1_048_576), "1.0 MB");
        assert_eq!(format_size(3_221_225_472), "3.0 GB");
    }
}
