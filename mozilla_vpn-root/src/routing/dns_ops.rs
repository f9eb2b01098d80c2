//! Per-link resolver configuration through systemd-resolved.

use async_trait::async_trait;
use tokio::process::Command;

use std::net::IpAddr;

use mozilla_vpn_lib::shell_command_ext::{Logs, ShellCommandExt};

use super::Error;

#[async_trait]
pub trait DnsOps: Send + Sync {
    /// Routes every lookup through `servers` on `ifname`.
    async fn set_resolvers(&self, ifname: &str, servers: &[IpAddr]) -> Result<(), Error>;
    /// Drops everything `set_resolvers` configured on `ifname`.
    async fn restore_resolvers(&self, ifname: &str) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct RealDnsOps;

#[async_trait]
impl DnsOps for RealDnsOps {
    async fn set_resolvers(&self, ifname: &str, servers: &[IpAddr]) -> Result<(), Error> {
        if servers.is_empty() {
            return Ok(());
        }
        let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
        Command::new("resolvectl")
            .arg("dns")
            .arg(ifname)
            .args(&servers)
            .run(Logs::Print)
            .await?;
        // "~." makes this link the default route for all domains
        Command::new("resolvectl")
            .args(["domain", ifname, "~."])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn restore_resolvers(&self, ifname: &str) -> Result<(), Error> {
        Command::new("resolvectl")
            .args(["revert", ifname])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }
}
