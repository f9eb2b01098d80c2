use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use std::path::{Path, PathBuf};
use std::time::Duration;

mod v1;

pub const DEFAULT_PATH: &str = "/etc/mozillavpn/daemon.toml";
pub const ENV_VAR: &str = "MOZILLAVPN_CONFIG_PATH";

pub const DEFAULT_INTERFACE: &str = "moz0";
/// Firewall mark of tunnel traffic, also used as the tunnel routing table id.
pub const DEFAULT_FWMARK: u32 = 0xca6c;
pub const DEFAULT_MTU: u16 = 1420;
pub const DEFAULT_CGROUP_MOUNTS: &str = "/proc/self/mounts";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

// IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitTunnelMode {
    /// Probe cgroup v1 net_cls, then cgroup v2 with eBPF.
    #[default]
    Auto,
    Disabled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub interface: String,
    pub fwmark: u32,
    pub table: u32,
    pub mtu: u16,
    pub default_route_capture: bool,
    pub split_tunnel: SplitTunnelMode,
    pub cgroup_mounts: PathBuf,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
    #[error("Invalid interface name `{0}`")]
    InvalidInterface(String),
    #[error("Firewall mark and routing table must be non zero")]
    ZeroMark,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: DEFAULT_INTERFACE.to_string(),
            fwmark: DEFAULT_FWMARK,
            table: DEFAULT_FWMARK,
            mtu: DEFAULT_MTU,
            default_route_capture: false,
            split_tunnel: SplitTunnelMode::default(),
            cgroup_mounts: PathBuf::from(DEFAULT_CGROUP_MOUNTS),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TryFrom<v1::Config> for Config {
    type Error = Error;

    fn try_from(value: v1::Config) -> Result<Self, Self::Error> {
        let defaults = Config::default();
        let interface = value.interface.unwrap_or(defaults.interface);
        if interface.is_empty()
            || interface.len() > MAX_INTERFACE_NAME
            || interface.contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(Error::InvalidInterface(interface));
        }
        let fwmark = value.fwmark.unwrap_or(defaults.fwmark);
        let table = value.table.unwrap_or(fwmark);
        if fwmark == 0 || table == 0 {
            return Err(Error::ZeroMark);
        }
        Ok(Config {
            interface,
            fwmark,
            table,
            mtu: value.mtu.unwrap_or(defaults.mtu),
            default_route_capture: value.default_route_capture.unwrap_or(defaults.default_route_capture),
            split_tunnel: value.split_tunnel.unwrap_or(defaults.split_tunnel),
            cgroup_mounts: value.cgroup_mounts.unwrap_or(defaults.cgroup_mounts),
            handshake_timeout: value.handshake_timeout.unwrap_or(defaults.handshake_timeout),
        })
    }
}

/// Reads the daemon configuration. A missing file yields the defaults.
pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no configuration file found - using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(Error::IO(e)),
    };
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            let wrong_keys = v1::wrong_keys(&table);
            for key in wrong_keys.iter() {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            res.try_into()
        }
        _ => Err(Error::VersionMismatch(version)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = read(&dir.path().join("daemon.toml")).await?;
        assert_eq!(config, Config::default());
        assert_eq!(config.table, 0xca6c);
        Ok(())
    }

    #[test]
    fn table_follows_fwmark_when_unset() -> anyhow::Result<()> {
        let config = parse("version = 1\nfwmark = 51821\n")?;
        assert_eq!(config.fwmark, 51821);
        assert_eq!(config.table, 51821);
        Ok(())
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(parse("version = 7"), Err(Error::VersionMismatch(7))));
        assert!(matches!(parse("interface = \"moz0\""), Err(Error::VersionNotFound)));
    }

    #[test]
    fn rejects_bad_interface_names() {
        assert!(matches!(
            parse("version = 1\ninterface = \"a-very-long-interface\""),
            Err(Error::InvalidInterface(_))
        ));
        assert!(matches!(parse("version = 1\ninterface = \"\""), Err(Error::InvalidInterface(_))));
        assert!(matches!(parse("version = 1\nfwmark = 0"), Err(Error::ZeroMark)));
    }
}
