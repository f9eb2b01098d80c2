//! Messages exchanged over the daemon socket.
//!
//! Every message is a single line of compact JSON tagged by its `type` field.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::interface_config::{ActivateRequest, InitializeRequest};
use crate::log_output;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Activate(ActivateRequest),
    Deactivate,
    Status,
    Logs,
    CleanLogs,
    Initialize(InitializeRequest),
    ExcludeCgroup { cgroup: String },
    ResetCgroup { cgroup: String },
    ResetAllCgroups,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Status(StatusResponse),
    Logs {
        logs: String,
    },
    Connected {
        pubkey: String,
    },
    Disconnected,
    BackendFailure,
    #[serde(rename_all = "camelCase")]
    Initialized {
        ok: bool,
        already_active: bool,
        uuid: String,
    },
    HandshakeFailed {
        pubkey: String,
    },
    Unauthorized {
        command: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv4_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv4_address: Option<String>,
    /// Milliseconds since the epoch at which the tunnel came up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<u64>,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_bytes: u64,
}

impl Command {
    /// Wire name of the command, as carried in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Activate(_) => "activate",
            Command::Deactivate => "deactivate",
            Command::Status => "status",
            Command::Logs => "logs",
            Command::CleanLogs => "cleanlogs",
            Command::Initialize(_) => "initialize",
            Command::ExcludeCgroup { .. } => "excludecgroup",
            Command::ResetCgroup { .. } => "resetcgroup",
            Command::ResetAllCgroups => "resetallcgroups",
        }
    }

    /// Commands that answer the caller directly with a response line.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::Status | Command::Logs | Command::Initialize(_))
    }
}

impl Response {
    pub fn disconnected_status() -> Self {
        Response::Status(StatusResponse::default())
    }

    /// Tunnel events are delivered to every connected client, replies only to
    /// the requesting one.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Response::Connected { .. }
                | Response::Disconnected
                | Response::BackendFailure
                | Response::HandshakeFailed { .. }
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = log_output::serialize(self);
        write!(f, "{s}")
    }
}

impl FromStr for Command {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = log_output::serialize(self);
        write!(f, "{s}")
    }
}

impl FromStr for Response {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_commands() -> anyhow::Result<()> {
        assert_eq!(r#"{"type":"status"}"#.parse::<Command>()?, Command::Status);
        assert_eq!(r#"{"type":"cleanlogs"}"#.parse::<Command>()?, Command::CleanLogs);
        assert_eq!(r#"{"type":"resetallcgroups"}"#.parse::<Command>()?, Command::ResetAllCgroups);
        Ok(())
    }

    #[test]
    fn parses_cgroup_command() -> anyhow::Result<()> {
        let cmd: Command = r#"{"type":"excludecgroup","cgroup":"/user.slice/app-firefox.scope"}"#.parse()?;
        assert_eq!(
            cmd,
            Command::ExcludeCgroup {
                cgroup: "/user.slice/app-firefox.scope".into()
            }
        );
        assert_eq!(cmd.name(), "excludecgroup");
        Ok(())
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(r#"{"type":"reboot"}"#.parse::<Command>().is_err());
        assert!("not json".parse::<Command>().is_err());
    }

    #[test]
    fn responses_use_camel_case_tags() -> anyhow::Result<()> {
        assert_eq!(Response::BackendFailure.to_string(), r#"{"type":"backendFailure"}"#);
        let init = Response::Initialized {
            ok: true,
            already_active: false,
            uuid: "abc".into(),
        };
        assert_eq!(
            init.to_string(),
            r#"{"type":"initialized","ok":true,"alreadyActive":false,"uuid":"abc"}"#
        );
        Ok(())
    }

    #[test]
    fn only_tunnel_events_are_broadcast() {
        assert!(Response::Disconnected.is_event());
        assert!(Response::HandshakeFailed { pubkey: "k".into() }.is_event());
        assert!(!Response::disconnected_status().is_event());
        assert!(!Response::Unauthorized { command: "activate".into() }.is_event());
    }
}
