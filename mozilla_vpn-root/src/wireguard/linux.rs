//! Linux WireGuard backend.
//!
//! The device is created with `ip link`, keyed and peered through `wg`, and
//! addressed and routed over rtnetlink. Every packet without the tunnel mark
//! is steered into the tunnel table by a pair of inverted policy rules; the
//! `wg` socket itself carries the mark and therefore keeps using the main
//! table.

use async_trait::async_trait;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use mozilla_vpn_lib::config::Config;
use mozilla_vpn_lib::interface_config::{DeviceConfig, HopType, InterfaceConfig, PublicKey};
use mozilla_vpn_lib::ip_address::IpAddress;
use mozilla_vpn_lib::log_output::{self, Sensitive};

use super::{Error, KEEPALIVE_SECS, PeerStatus, WireguardUtils};
use crate::routing::firewall::SharedFirewall;
use crate::routing::iptables_ops::IptablesOps;
use crate::routing::netlink_ops::{LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use crate::routing::wg_ops::{PeerSpec, WgOps};
use crate::routing::{self, PROTOCOL_BOOT, ignore_not_found, teardown_op};

pub const SYSFS_NET: &str = "/sys/class/net";

/// Parameters of the tunnel device.
#[derive(Clone, Debug, PartialEq)]
pub struct TunnelSettings {
    pub ifname: String,
    pub fwmark: u32,
    pub table: u32,
    pub mtu: u16,
    pub sysfs_root: PathBuf,
}

impl From<&Config> for TunnelSettings {
    fn from(config: &Config) -> Self {
        TunnelSettings {
            ifname: config.interface.clone(),
            fwmark: config.fwmark,
            table: config.table,
            mtu: config.mtu,
            sysfs_root: PathBuf::from(SYSFS_NET),
        }
    }
}

pub struct LinuxWireguardUtils<N, W, I: IptablesOps> {
    netlink: N,
    wg: W,
    firewall: SharedFirewall<I>,
    settings: TunnelSettings,
    if_index: Option<u32>,
    /// Destination rules of multihop entry peers.
    entry_rules: Vec<RuleSpec>,
    /// Server address marked inbound per peer.
    endpoints: HashMap<PublicKey, IpAddr>,
}

impl<N, W, I> LinuxWireguardUtils<N, W, I>
where
    N: NetlinkOps + 'static,
    W: WgOps + 'static,
    I: IptablesOps + 'static,
{
    pub fn new(netlink: N, wg: W, firewall: SharedFirewall<I>, settings: TunnelSettings) -> Self {
        LinuxWireguardUtils {
            netlink,
            wg,
            firewall,
            settings,
            if_index: None,
            entry_rules: Vec::new(),
            endpoints: HashMap::new(),
        }
    }

    /// "not fwmark M lookup T", both families.
    fn invert_rules(&self) -> [RuleSpec; 2] {
        [false, true].map(|v6| RuleSpec {
            v6,
            fw_mark: self.settings.fwmark,
            invert: true,
            destination: None,
            table_id: self.settings.table,
            priority: None,
        })
    }

    /// "fwmark M to P lookup T": the marked `wg` traffic towards the exit
    /// server goes through the entry tunnel instead of the main table.
    fn entry_rule(&self, prefix: &IpAddress) -> RuleSpec {
        RuleSpec {
            v6: prefix.is_ipv6(),
            fw_mark: self.settings.fwmark,
            invert: false,
            destination: Some(*prefix),
            table_id: self.settings.table,
            priority: None,
        }
    }

    async fn add_rule(&self, rule: &RuleSpec) -> Result<bool, routing::Error> {
        match self.netlink.rule_add(rule).await {
            Ok(()) => Ok(true),
            Err(routing::Error::Exists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn tunnel_index(&mut self) -> Result<u32, Error> {
        if let Some(index) = self.if_index {
            return Ok(index);
        }
        let link = self
            .netlink
            .link_by_name(&self.settings.ifname)
            .await?
            .filter(|l| l.is_wireguard)
            .ok_or_else(|| Error::NoInterface(self.settings.ifname.clone()))?;
        self.if_index = Some(link.index);
        Ok(link.index)
    }

    fn prefix_route(&self, prefix: &IpAddress, if_index: u32) -> RouteSpec {
        RouteSpec {
            if_index: Some(if_index),
            protocol: PROTOCOL_BOOT,
            ..RouteSpec::unicast(*prefix, self.settings.table)
        }
    }

    async fn configure_interface(&mut self, device: &DeviceConfig) -> Result<(), Error> {
        let ifname = self.settings.ifname.clone();
        self.wg.set_device(&ifname, &device.private_key, self.settings.fwmark).await?;

        let index = self.tunnel_index().await?;
        for address in device.addresses() {
            self.netlink.addr_add(index, address).await?;
        }
        self.wg.link_up(&ifname, self.settings.mtu).await?;
        tracing::debug!(ifname, index, mtu = self.settings.mtu, "tunnel link up");

        for rule in self.invert_rules() {
            self.add_rule(&rule).await?;
        }
        self.firewall.lock().await.up(&ifname, self.settings.fwmark)?;
        Ok(())
    }

    /// Reinstalls the policy rules and the firewall when the interface was
    /// adopted from a previous daemon run.
    async fn ensure_policy(&self) -> Result<(), routing::Error> {
        for rule in self.invert_rules() {
            self.add_rule(&rule).await?;
        }
        let mut firewall = self.firewall.lock().await;
        if !firewall.is_up() {
            firewall.up(&self.settings.ifname, self.settings.fwmark)?;
        }
        Ok(())
    }

    async fn wireguard_link(&self) -> Option<LinkInfo> {
        match self.netlink.link_by_name(&self.settings.ifname).await {
            Ok(link) => link.filter(|l| l.is_wireguard),
            Err(error) => {
                tracing::warn!(%error, "unable to list links");
                None
            }
        }
    }

    async fn remove_entry_rules(&mut self, config: &InterfaceConfig) {
        for prefix in config.peer_allowed_ips() {
            let rule = self.entry_rule(&prefix);
            if let Err(error) = ignore_not_found(self.netlink.rule_del(&rule).await) {
                tracing::warn!(%error, prefix = %Sensitive(prefix), "failed to delete entry rule, continuing anyway");
            }
            self.entry_rules.retain(|r| !r.same_key(&rule));
        }
    }
}

#[async_trait]
impl<N, W, I> WireguardUtils for LinuxWireguardUtils<N, W, I>
where
    N: NetlinkOps + 'static,
    W: WgOps + 'static,
    I: IptablesOps + 'static,
{
    async fn interface_exists(&mut self) -> bool {
        let link = self.wireguard_link().await;
        self.if_index = link.as_ref().map(|l| l.index);
        link.is_some()
    }

    async fn add_interface(&mut self, device: &DeviceConfig) -> Result<(), Error> {
        if !self.wg.available().await {
            log_output::print_missing_wireguard_tools();
            return Err(Error::ToolingMissing);
        }
        let ifname = self.settings.ifname.clone();
        if let Some(link) = self.netlink.link_by_name(&ifname).await? {
            if !link.is_wireguard {
                return Err(Error::NotWireguard(ifname));
            }
            return Err(routing::Error::Exists(ifname).into());
        }

        self.wg.link_add(&ifname).await?;
        if let Err(e) = self.configure_interface(device).await {
            tracing::error!(error = %e, "interface setup failed, rolling back");
            if let Err(rollback_err) = self.delete_interface().await {
                tracing::warn!(%rollback_err, "rollback failed: could not delete interface");
            }
            return Err(e);
        }
        tracing::info!(ifname, "tunnel interface added");
        Ok(())
    }

    async fn update_peer(&mut self, config: &InterfaceConfig, endpoint: SocketAddr) -> Result<(), Error> {
        let ifname = self.settings.ifname.clone();
        let allowed_ips = config.peer_allowed_ips();

        let mut added = Vec::new();
        if config.hop_type == HopType::MultiHopEntry {
            for prefix in &allowed_ips {
                let rule = self.entry_rule(prefix);
                match self.add_rule(&rule).await {
                    Ok(true) => added.push(rule),
                    Ok(false) => {}
                    Err(e) => {
                        for rule in &added {
                            teardown_op("delete entry rule", || self.netlink.rule_del(rule)).await;
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        let marked = match self.ensure_policy().await {
            Ok(()) => self.firewall.lock().await.mark_inbound(endpoint.ip()),
            Err(e) => Err(e),
        };
        if let Err(e) = marked {
            for rule in &added {
                teardown_op("delete entry rule", || self.netlink.rule_del(rule)).await;
            }
            return Err(e.into());
        }

        let peer = PeerSpec {
            public_key: config.server_public_key.clone(),
            endpoint,
            allowed_ips,
            keepalive: KEEPALIVE_SECS,
        };
        if let Err(e) = self.wg.set_peer(&ifname, &peer).await {
            tracing::error!(error = %e, "peer setup failed, rolling back");
            for rule in &added {
                teardown_op("delete entry rule", || self.netlink.rule_del(rule)).await;
            }
            return Err(e.into());
        }

        self.entry_rules.extend(added);
        if let Some(previous) = self.endpoints.insert(config.server_public_key.clone(), endpoint.ip()) {
            if previous != endpoint.ip() {
                if let Err(error) = self.firewall.lock().await.clear_inbound(previous) {
                    tracing::warn!(%error, "failed to clear previous inbound mark, continuing anyway");
                }
            }
        }
        tracing::info!(
            pubkey = log_output::key(config.server_public_key.as_base64()),
            endpoint = %Sensitive(endpoint),
            hop = %config.hop_type,
            "peer configured"
        );
        Ok(())
    }

    async fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<(), Error> {
        if config.hop_type == HopType::MultiHopEntry {
            self.remove_entry_rules(config).await;
        }
        if let Some(server) = self.endpoints.remove(&config.server_public_key) {
            if let Err(error) = self.firewall.lock().await.clear_inbound(server) {
                tracing::warn!(%error, "failed to clear inbound mark, continuing anyway");
            }
        }
        if !self.interface_exists().await {
            return Ok(());
        }
        ignore_not_found(
            self.wg
                .remove_peer(&self.settings.ifname, &config.server_public_key)
                .await,
        )?;
        tracing::info!(pubkey = log_output::key(config.server_public_key.as_base64()), "peer removed");
        Ok(())
    }

    async fn delete_interface(&mut self) -> Result<(), Error> {
        let invert = self.invert_rules();
        let rules: Vec<RuleSpec> = self.entry_rules.drain(..).chain(invert).collect();
        for rule in &rules {
            if let Err(error) = ignore_not_found(self.netlink.rule_del(rule).await) {
                tracing::warn!(%error, ?rule, "failed to delete policy rule, continuing anyway");
            }
        }
        self.firewall.lock().await.down();
        self.endpoints.clear();
        self.if_index = None;

        let Some(link) = self.netlink.link_by_name(&self.settings.ifname).await? else {
            return Ok(());
        };
        if !link.is_wireguard {
            tracing::warn!(ifname = link.name, "not deleting foreign interface");
            return Ok(());
        }
        ignore_not_found(self.netlink.link_del(link.index).await)?;
        tracing::info!(ifname = self.settings.ifname, "tunnel interface deleted");
        Ok(())
    }

    async fn get_peer_status(&self) -> Result<Vec<PeerStatus>, Error> {
        if self.wireguard_link().await.is_none() {
            return Ok(Vec::new());
        }
        Ok(self.wg.dump(&self.settings.ifname).await?)
    }

    async fn update_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), Error> {
        let index = self.tunnel_index().await?;
        self.netlink.route_replace(&self.prefix_route(prefix, index)).await?;
        tracing::debug!(prefix = %Sensitive(prefix), "allowed-ip route added");
        Ok(())
    }

    async fn delete_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), Error> {
        let index = match self.tunnel_index().await {
            Ok(index) => index,
            // routes die with the link
            Err(Error::NoInterface(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        ignore_not_found(self.netlink.route_del(&self.prefix_route(prefix, index)).await)?;
        tracing::debug!(prefix = %Sensitive(prefix), "allowed-ip route deleted");
        Ok(())
    }

    async fn interface_counters(&self) -> Option<(u64, u64)> {
        let stats = self.settings.sysfs_root.join(&self.settings.ifname).join("statistics");
        let read = |name: &'static str| {
            let path = stats.join(name);
            async move {
                let raw = tokio::fs::read_to_string(&path).await.ok()?;
                raw.trim().parse::<u64>().ok()
            }
        };
        let tx = read("tx_bytes").await?;
        let rx = read("rx_bytes").await?;
        Some((tx, rx))
    }

    fn interface_index(&self) -> Option<u32> {
        self.if_index
    }
}
