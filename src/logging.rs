//! Logging setup.
//!
//! Initializes `tracing-subscriber` once, at startup, writing to a
//! platform-appropriate log file opened in append mode rather than stdout -
//! CLI output is reserved for the command's actual result. Mirrors the
//! reference client's `setupLogger`, which pointed its logger at a file
//! under the user's local data directory before any subcommand ran.
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "rstc.log";

/// Resolves the platform-appropriate log file path: `~/.local/share/rstc/rstc.log`
/// on Linux, `~/Library/Logs/rstc/rstc.log` on macOS (via `dirs::data_dir`
/// picking the right base on each), `%LOCALAPPDATA%\rstc\rstc.log` on
/// Windows.
pub fn log_file_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine a platform data directory")?;
    Ok(base.join("rstc").join(LOG_FILE_NAME))
}

/// Initializes the global `tracing` subscriber.
///
/// Log level is controlled by `RUST_LOG`, defaulting to `info` when unset.
/// Returns the resolved log file path so the caller can mention it (e.g. in
/// a `--verbose` CLI flag's help text).
pub fn init() -> Result<PathBuf> {
    let path = log_file_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file)
        .with_ansi(false)
        .init();

    Ok(path)
}
