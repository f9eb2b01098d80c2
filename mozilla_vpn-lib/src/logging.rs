use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_VAR_LOG_FILE: &str = "MOZILLAVPN_LOG_FILE";
pub const DEFAULT_LOG_FILE: &str = "/var/log/mozillavpn-daemon.log";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open log file {path}: {error}")]
    Open { path: PathBuf, error: io::Error },
    #[error("failed to swap log file layer: {0}")]
    Reload(#[from] reload::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Log file currently written by the daemon, reopenable at runtime.
pub struct LogFile {
    path: PathBuf,
    handle: LogReloadHandle,
}

/// Creates a [`FileFmtLayer`] appending to `log_path` with ANSI colors disabled.
///
/// Also used to reopen the file after it was truncated.
pub fn make_file_fmt_layer(log_path: &Path) -> Result<FileFmtLayer, Error> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| Error::Open {
            path: log_path.to_path_buf(),
            error,
        })?;

    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Initializes the global `tracing` subscriber with a reloadable file layer.
///
/// Verbosity comes from `RUST_LOG` and falls back to `"info"`. The returned
/// [`LogFile`] serves the `logs` and `cleanlogs` commands.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_log_file(log_path: PathBuf) -> Result<LogFile, Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (reload_layer, handle) = reload::Layer::new(make_file_fmt_layer(&log_path)?);
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    tracing::debug!(path = %log_path.display(), "logging initialized with file output");
    Ok(LogFile { path: log_path, handle })
}

/// Initializes the global `tracing` subscriber writing to stdout.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_stdout() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .init();
    tracing::debug!("logging initialized with stdout/stderr output");
}

impl LogFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log content on a single line, newlines replaced by `|`.
    pub fn read_flat(&self) -> Result<String, Error> {
        read_flat(&self.path)
    }

    /// Empties the file and points the writer at the fresh file.
    pub fn truncate(&self) -> Result<(), Error> {
        OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        let layer = make_file_fmt_layer(&self.path)?;
        self.handle.reload(layer)?;
        tracing::info!("log file truncated");
        Ok(())
    }
}

pub fn read_flat(path: &Path) -> Result<String, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(content.trim_end_matches('\n').replace('\n', "|"))
}
