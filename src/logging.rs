use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "modroster.log";

/// Sends events to stderr and appends them to the log file in `data_dir`.
///
/// `RUST_LOG` wins over `verbose`. Calling this twice keeps the first
/// subscriber.
pub fn init(data_dir: &Path, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(data_dir).context("create app data dir")?;
    let log_path = data_dir.join(LOG_FILE_NAME);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let log_file = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(log_file)
        .try_init();
    Ok(log_path)
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "modroster=debug,info"
    } else {
        "warn,modroster=info"
    }
}
