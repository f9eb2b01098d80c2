use clap::{Parser, Subcommand};

use std::path::PathBuf;
use std::time::Duration;

use mozilla_vpn_lib::command::Command as LibCommand;
use mozilla_vpn_lib::interface_config::{ActivateRequest, InitializeRequest};
use mozilla_vpn_lib::socket;

/// Mozilla VPN control - drive the VPN daemon from the command line
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Specify socket path
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// How long to wait for the daemon to answer
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Format output as json
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query tunnel status and traffic counters
    #[command()]
    Status,

    /// Create the tunnel interface from a device description
    #[command()]
    Initialize {
        /// JSON file with `privateKey` and device addresses, `-` for stdin
        file: PathBuf,
    },

    /// Bring up or switch one hop of the tunnel
    #[command()]
    Activate {
        /// JSON file with the activation payload, `-` for stdin
        file: PathBuf,
        /// Return right after sending instead of waiting for the handshake
        #[arg(long)]
        no_wait: bool,
    },

    /// Tear the tunnel down
    #[command()]
    Deactivate,

    /// Print the daemon log
    #[command()]
    Logs,

    /// Empty the daemon log
    #[command()]
    CleanLogs,

    /// Route the traffic of a cgroup outside of the tunnel
    #[command()]
    ExcludeCgroup {
        /// Path relative to the cgroup hierarchy root
        cgroup: String,
    },

    /// Send the traffic of a cgroup through the tunnel again
    #[command()]
    ResetCgroup {
        /// Path relative to the cgroup hierarchy root
        cgroup: String,
    },

    /// Undo every cgroup exclusion
    #[command()]
    ResetAllCgroups,

    /// Print tunnel events as they arrive
    #[command()]
    Watch,
}

/// Payloads read from files are parsed into the wire requests here.
pub enum Payload {
    Initialize(InitializeRequest),
    Activate(ActivateRequest),
}

impl Command {
    pub fn payload_file(&self) -> Option<&PathBuf> {
        match self {
            Command::Initialize { file } | Command::Activate { file, .. } => Some(file),
            _ => None,
        }
    }

    /// The IPC command, `None` for local only commands.
    pub fn into_lib(self, payload: Option<Payload>) -> Option<LibCommand> {
        let cmd = match (self, payload) {
            (Command::Status, _) => LibCommand::Status,
            (Command::Initialize { .. }, Some(Payload::Initialize(req))) => LibCommand::Initialize(req),
            (Command::Activate { .. }, Some(Payload::Activate(req))) => LibCommand::Activate(req),
            (Command::Initialize { .. } | Command::Activate { .. }, _) => return None,
            (Command::Deactivate, _) => LibCommand::Deactivate,
            (Command::Logs, _) => LibCommand::Logs,
            (Command::CleanLogs, _) => LibCommand::CleanLogs,
            (Command::ExcludeCgroup { cgroup }, _) => LibCommand::ExcludeCgroup { cgroup },
            (Command::ResetCgroup { cgroup }, _) => LibCommand::ResetCgroup { cgroup },
            (Command::ResetAllCgroups, _) => LibCommand::ResetAllCgroups,
            (Command::Watch, _) => return None,
        };
        Some(cmd)
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
