use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: stdout always, plus `log_path` when given.
/// The log file is truncated so each run starts a fresh file. Calling this
/// again after a successful init does nothing.
pub fn init(log_path: Option<&Path>) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false);
    let file = match log_path {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init()
        .context("install tracing subscriber")?;
    let _ = INITIALIZED.set(());
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_log_file_truncates_and_creates_parents() {
        let tmp = std::env::temp_dir().join("devicelink-log-test");
        let _ = std::fs::remove_dir_all(&tmp);
        let log_path = tmp.join("logs").join("devicelink.log");
        std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
        std::fs::write(&log_path, "old\n").unwrap();

        let mut file = open_log_file(&log_path).unwrap();
        std::io::Write::write_all(&mut file, b"fresh\n").unwrap();
        drop(file);

        let raw = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(raw, "fresh\n");
    }
}
