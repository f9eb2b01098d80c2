//! WireGuard device management abstraction.
//!
//! Defines [`WgOps`] for the parts of the tunnel that are driven through the
//! `ip` and `wg` command line tools: creating the device, loading the key and
//! the peer table, and dumping peer statistics.
//!
//! Production code uses [`RealWgOps`].
//! Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::net::SocketAddr;
use std::process::Stdio;

use mozilla_vpn_lib::interface_config::{PrivateKey, PublicKey};
use mozilla_vpn_lib::ip_address::IpAddress;
use mozilla_vpn_lib::shell_command_ext::{self, Logs, ShellCommandExt};

use super::Error;
use crate::wireguard::PeerStatus;

/// Everything `wg set ... peer` needs.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSpec {
    pub public_key: PublicKey,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpAddress>,
    pub keepalive: u16,
}

#[async_trait]
pub trait WgOps: Send + Sync + Clone {
    /// Whether the `wg` binary can be executed.
    async fn available(&self) -> bool;
    async fn link_add(&self, ifname: &str) -> Result<(), Error>;
    async fn link_up(&self, ifname: &str, mtu: u16) -> Result<(), Error>;
    async fn set_device(&self, ifname: &str, private_key: &PrivateKey, fwmark: u32) -> Result<(), Error>;
    async fn set_peer(&self, ifname: &str, peer: &PeerSpec) -> Result<(), Error>;
    async fn remove_peer(&self, ifname: &str, public_key: &PublicKey) -> Result<(), Error>;
    async fn dump(&self, ifname: &str) -> Result<Vec<PeerStatus>, Error>;
}

#[derive(Clone)]
pub struct RealWgOps;

#[async_trait]
impl WgOps for RealWgOps {
    async fn available(&self) -> bool {
        Command::new("which")
            .arg("wg")
            .run(Logs::Suppress)
            .await
            .is_ok()
    }

    async fn link_add(&self, ifname: &str) -> Result<(), Error> {
        Command::new("ip")
            .args(["link", "add", "dev", ifname, "type", "wireguard"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn link_up(&self, ifname: &str, mtu: u16) -> Result<(), Error> {
        Command::new("ip")
            .args(["link", "set", "dev", ifname, "mtu", &mtu.to_string(), "up"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn set_device(&self, ifname: &str, private_key: &PrivateKey, fwmark: u32) -> Result<(), Error> {
        // the key must never show up in argv
        let mut cmd = Command::new("wg");
        cmd.args([
            "set",
            ifname,
            "private-key",
            "/dev/stdin",
            "fwmark",
            &format!("{fwmark:#x}"),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        let cmd_debug = format!("{:?}", cmd);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(private_key.as_base64().as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        let output = child.wait_with_output().await?;
        shell_command_ext::stdout_from_output(cmd_debug, output, Logs::Print)?;
        Ok(())
    }

    async fn set_peer(&self, ifname: &str, peer: &PeerSpec) -> Result<(), Error> {
        let allowed = peer
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Command::new("wg")
            .args([
                "set",
                ifname,
                "peer",
                peer.public_key.as_base64(),
                "endpoint",
                &peer.endpoint.to_string(),
                "persistent-keepalive",
                &peer.keepalive.to_string(),
                "allowed-ips",
                &allowed,
            ])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn remove_peer(&self, ifname: &str, public_key: &PublicKey) -> Result<(), Error> {
        Command::new("wg")
            .args(["set", ifname, "peer", public_key.as_base64(), "remove"])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn dump(&self, ifname: &str) -> Result<Vec<PeerStatus>, Error> {
        let out = Command::new("wg")
            .args(["show", ifname, "dump"])
            .run_stdout(Logs::Suppress)
            .await?;
        Ok(parse_dump(&out))
    }
}

/// Parses `wg show <if> dump`.
///
/// The first line describes the device, every following line one peer:
/// `pubkey psk endpoint allowed-ips latest-handshake rx tx keepalive`,
/// tab separated, handshake in seconds since the epoch (0 for never).
pub fn parse_dump(out: &str) -> Vec<PeerStatus> {
    out.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 8 {
                tracing::debug!(line, "skipping malformed wg dump line");
                return None;
            }
            let public_key = PublicKey::parse(fields[0], "wg dump").ok()?;
            let handshake_secs = fields[4].parse::<u64>().unwrap_or(0);
            Some(PeerStatus {
                public_key,
                last_handshake_ms: handshake_secs.saturating_mul(1000),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}
