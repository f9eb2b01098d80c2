use thiserror::Error;

use std::{fs, io, path::PathBuf};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub const ENV_VAR_HOME: &str = "MOZILLAVPN_HOME";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/mozillavpn";

/// Path of `file` inside the daemon state directory, creating the directory.
pub fn state_file(file: &str) -> Result<PathBuf, Error> {
    let home = get_home();
    let state_file = home.join(file);
    tracing::debug!("Using state file: {}", state_file.display());
    fs::create_dir_all(&home)?;
    Ok(state_file)
}

fn get_home() -> PathBuf {
    match std::env::var(ENV_VAR_HOME) {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => PathBuf::from(DEFAULT_STATE_DIR),
    }
}
