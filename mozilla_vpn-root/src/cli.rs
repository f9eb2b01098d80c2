use clap::Parser;

use std::path::PathBuf;

use mozilla_vpn_lib::{config, logging, socket};

/// Mozilla VPN daemon - privileged tunnel and routing control for the VPN client
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for communication with this service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// General configuration file, defaults apply when it does not exist
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
        )]
    pub config_path: PathBuf,

    /// Log file served by the `logs` command
    #[arg(long, env = logging::ENV_VAR_LOG_FILE, default_value = logging::DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    /// Log to stdout instead of the log file
    #[arg(long, conflicts_with = "log_file")]
    pub stdout: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
