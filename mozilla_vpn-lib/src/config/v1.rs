use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;

use super::SplitTunnelMode;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    pub version: u8,
    pub interface: Option<String>,
    pub fwmark: Option<u32>,
    pub table: Option<u32>,
    pub mtu: Option<u16>,
    pub default_route_capture: Option<bool>,
    pub split_tunnel: Option<SplitTunnelMode>,
    pub cgroup_mounts: Option<PathBuf>,
    #[serde(default, with = "humantime_serde::option")]
    pub handshake_timeout: Option<Duration>,
}

const KNOWN_KEYS: [&str; 9] = [
    "version",
    "interface",
    "fwmark",
    "table",
    "mtu",
    "default_route_capture",
    "split_tunnel",
    "cgroup_mounts",
    "handshake_timeout",
];

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    table
        .keys()
        .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
        .cloned()
        .collect()
}
