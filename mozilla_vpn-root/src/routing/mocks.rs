//! Stateful mocks for the platform capability traits.
//!
//! The mocks keep the state a real kernel would keep (routes, rules, links,
//! chains, peers) so tests assert on what is left behind after a lifecycle
//! operation rather than on call sequences.
//!
//! All mocks use `Arc<Mutex<_>>` so clones share one state.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use mozilla_vpn_lib::interface_config::{
    ActivateRequest, AllowedRange, DeviceConfig, HopType, InitializeRequest, InterfaceConfig, PrivateKey, PublicKey,
};
use mozilla_vpn_lib::ip_address::IpAddress;

use super::Error;
use super::dns_ops::DnsOps;
use super::iptables_ops::{IptablesOps, IptablesResult};
use super::netlink_ops::{LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use super::wg_ops::{PeerSpec, WgOps};
use crate::split_tunnel::{self, SplitTunnel};
use crate::wireguard::endpoint::{self, EndpointResolver};
use crate::wireguard::{self, PeerStatus, WireguardUtils};

// ============================================================================
// Fixtures
// ============================================================================

pub const PRIVATE_KEY: &str = "YEocP0e2o1WT5GlvBvQzVF7EeR6z9aCk7ANhTrnrvkM=";
pub const SERVER_KEY: &str = "JPT1veXLmasj2uQDstX24mpR7VWD+GmV8JDkidkz91Q=";
pub const OTHER_SERVER_KEY: &str = "HpNFfTUuibcnrSPKo2f6D8fQMx2Ku7s+DHShUhqVnzc=";

pub fn initialize_request() -> InitializeRequest {
    InitializeRequest {
        private_key: Some(PRIVATE_KEY.into()),
        device_ipv4_address: Some("10.67.12.5/32".into()),
        device_ipv6_address: Some("fc00:bbbb:bbbb:bb01::4:c04/128".into()),
    }
}

pub fn activate_request(hop: HopType) -> ActivateRequest {
    ActivateRequest {
        private_key: Some(PRIVATE_KEY.into()),
        server_public_key: Some(SERVER_KEY.into()),
        server_port: Some(51820),
        device_ipv4_address: Some("10.67.12.5/32".into()),
        device_ipv6_address: Some("fc00:bbbb:bbbb:bb01::4:c04/128".into()),
        server_ipv4_addr_in: Some("185.65.135.5".into()),
        server_ipv4_gateway: Some("10.64.0.1".into()),
        server_ipv6_gateway: Some("fc00:bbbb:bbbb:bb01::1".into()),
        dns_server: Some("10.64.0.1".into()),
        hop_type: Some(hop),
        allowed_ip_address_ranges: Some(vec![
            AllowedRange {
                address: "185.213.154.0".into(),
                range: 24,
                is_ipv6: false,
            },
            AllowedRange {
                address: "10.64.0.1".into(),
                range: 32,
                is_ipv6: false,
            },
        ]),
        ..Default::default()
    }
}

pub fn interface_config(hop: HopType) -> InterfaceConfig {
    InterfaceConfig::try_from(activate_request(hop)).expect("fixture config parses")
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig::try_from(initialize_request()).expect("fixture device parses")
}

pub fn endpoint() -> SocketAddr {
    SocketAddr::new(IpAddr::from([185, 65, 135, 5]), 51820)
}

fn fail(fail_on: &HashMap<String, String>, op: &str) -> Result<(), Error> {
    match fail_on.get(op) {
        Some(msg) => Err(Error::General(msg.clone())),
        None => Ok(()),
    }
}

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<(u32, IpAddress)>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn next_index(&self) -> u32 {
        self.links.iter().map(|l| l.index).max().unwrap_or(1) + 1
    }
}

#[derive(Clone, Default)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, index: u32, name: &str, up: bool) {
        self.state.lock().unwrap().links.push(LinkInfo {
            index,
            name: name.to_string(),
            up,
            is_wireguard: false,
        });
    }

    /// Creates a WireGuard link and returns its index.
    pub fn add_wireguard_link(&self, name: &str) -> u32 {
        let mut s = self.state.lock().unwrap();
        let index = s.next_index();
        s.links.push(LinkInfo {
            index,
            name: name.to_string(),
            up: false,
            is_wireguard: true,
        });
        index
    }

    pub fn set_link_up(&self, name: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(link) = s.links.iter_mut().find(|l| l.name == name) {
            link.up = true;
        }
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.iter().any(|l| l.name == name)
    }

    /// Adds a route the way another program would, without duplicate checks.
    pub fn push_route(&self, route: RouteSpec) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub fn remove_route(&self, table_id: u32, destination: &IpAddress) {
        self.state
            .lock()
            .unwrap()
            .routes
            .retain(|r| !(r.table_id == table_id && r.destination == *destination));
    }

    pub fn clear_table(&self, table_id: u32) {
        self.state.lock().unwrap().routes.retain(|r| r.table_id != table_id);
    }

    pub fn routes_in(&self, table_id: u32) -> Vec<RouteSpec> {
        self.state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| r.table_id == table_id)
            .cloned()
            .collect()
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn fail_on(&self, op: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(op.to_string(), format!("injected {op} failure"));
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "route_add")?;
        if s.routes.iter().any(|r| r.same_key(route)) {
            return Err(Error::Exists(route.destination.to_string()));
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "route_replace")?;
        s.routes.retain(|r| !r.same_key(route));
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "route_del")?;
        let before = s.routes.len();
        s.routes.retain(|r| !r.same_key(route));
        if s.routes.len() == before {
            return Err(Error::NotFound(format!("route {}", route.destination)));
        }
        Ok(())
    }

    async fn route_list(&self, v6: bool, table_id: u32) -> Result<Vec<RouteSpec>, Error> {
        let s = self.state.lock().unwrap();
        fail(&s.fail_on, "route_list")?;
        Ok(s.routes
            .iter()
            .filter(|r| r.table_id == table_id && r.destination.is_ipv6() == v6)
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "rule_add")?;
        if s.rules.iter().any(|r| r.same_key(rule)) {
            return Err(Error::Exists(format!("rule {rule:?}")));
        }
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "rule_del")?;
        let Some(pos) = s.rules.iter().position(|r| r.same_key(rule)) else {
            return Err(Error::NotFound(format!("rule {rule:?}")));
        };
        s.rules.remove(pos);
        Ok(())
    }

    async fn rule_list(&self, v6: bool) -> Result<Vec<RuleSpec>, Error> {
        let s = self.state.lock().unwrap();
        fail(&s.fail_on, "rule_list")?;
        Ok(s.rules.iter().filter(|r| r.v6 == v6).cloned().collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let s = self.state.lock().unwrap();
        fail(&s.fail_on, "link_list")?;
        Ok(s.links.clone())
    }

    async fn link_del(&self, index: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "link_del")?;
        let Some(pos) = s.links.iter().position(|l| l.index == index) else {
            return Err(Error::NotFound(format!("link {index}")));
        };
        s.links.remove(pos);
        // the kernel drops routes and addresses together with the link
        s.routes.retain(|r| r.if_index != Some(index));
        s.addrs.retain(|(i, _)| *i != index);
        Ok(())
    }

    async fn addr_add(&self, index: u32, address: &IpAddress) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "addr_add")?;
        if !s.links.iter().any(|l| l.index == index) {
            return Err(Error::NotFound(format!("link {index}")));
        }
        s.addrs.push((index, *address));
        Ok(())
    }
}

// ============================================================================
// MockWgOps
// ============================================================================

#[derive(Debug, Default)]
pub struct WgDevice {
    pub private_key: Option<PrivateKey>,
    pub fwmark: u32,
    pub mtu: Option<u16>,
    pub peers: Vec<PeerSpec>,
}

#[derive(Debug)]
pub struct WgState {
    pub available: bool,
    pub devices: HashMap<String, WgDevice>,
    /// Handshake timestamps reported by `dump`, in seconds.
    pub handshakes: HashMap<PublicKey, u64>,
    pub fail_on: HashMap<String, String>,
}

impl Default for WgState {
    fn default() -> Self {
        WgState {
            available: true,
            devices: HashMap::new(),
            handshakes: HashMap::new(),
            fail_on: HashMap::new(),
        }
    }
}

/// WireGuard tooling backed by the link table of a [`MockNetlinkOps`], so that
/// links created here show up in netlink listings and vanish on `link_del`.
#[derive(Clone)]
pub struct MockWgOps {
    pub netlink: MockNetlinkOps,
    pub state: Arc<Mutex<WgState>>,
}

impl MockWgOps {
    pub fn new(netlink: &MockNetlinkOps) -> Self {
        Self {
            netlink: netlink.clone(),
            state: Arc::new(Mutex::new(WgState::default())),
        }
    }

    pub fn fail_on(&self, op: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(op.to_string(), format!("injected {op} failure"));
    }

    pub fn peers(&self, ifname: &str) -> Vec<PeerSpec> {
        if !self.netlink.has_link(ifname) {
            return Vec::new();
        }
        self.state
            .lock()
            .unwrap()
            .devices
            .get(ifname)
            .map(|d| d.peers.clone())
            .unwrap_or_default()
    }

    fn check_device(&self, ifname: &str) -> Result<(), Error> {
        if self.netlink.has_link(ifname) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Cannot find device \"{ifname}\"")))
        }
    }
}

#[async_trait]
impl WgOps for MockWgOps {
    async fn available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    async fn link_add(&self, ifname: &str) -> Result<(), Error> {
        fail(&self.state.lock().unwrap().fail_on, "link_add")?;
        if self.netlink.has_link(ifname) {
            return Err(Error::Exists(ifname.to_string()));
        }
        self.netlink.add_wireguard_link(ifname);
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(ifname.to_string(), WgDevice::default());
        Ok(())
    }

    async fn link_up(&self, ifname: &str, mtu: u16) -> Result<(), Error> {
        fail(&self.state.lock().unwrap().fail_on, "link_up")?;
        self.check_device(ifname)?;
        self.netlink.set_link_up(ifname);
        self.state.lock().unwrap().devices.entry(ifname.to_string()).or_default().mtu = Some(mtu);
        Ok(())
    }

    async fn set_device(&self, ifname: &str, private_key: &PrivateKey, fwmark: u32) -> Result<(), Error> {
        fail(&self.state.lock().unwrap().fail_on, "set_device")?;
        self.check_device(ifname)?;
        let mut s = self.state.lock().unwrap();
        let device = s.devices.entry(ifname.to_string()).or_default();
        device.private_key = Some(private_key.clone());
        device.fwmark = fwmark;
        Ok(())
    }

    async fn set_peer(&self, ifname: &str, peer: &PeerSpec) -> Result<(), Error> {
        fail(&self.state.lock().unwrap().fail_on, "set_peer")?;
        self.check_device(ifname)?;
        let mut s = self.state.lock().unwrap();
        let device = s.devices.entry(ifname.to_string()).or_default();
        device.peers.retain(|p| p.public_key != peer.public_key);
        device.peers.push(peer.clone());
        Ok(())
    }

    async fn remove_peer(&self, ifname: &str, public_key: &PublicKey) -> Result<(), Error> {
        fail(&self.state.lock().unwrap().fail_on, "remove_peer")?;
        self.check_device(ifname)?;
        // wg(8) accepts removing an unknown peer
        if let Some(device) = self.state.lock().unwrap().devices.get_mut(ifname) {
            device.peers.retain(|p| p.public_key != *public_key);
        }
        Ok(())
    }

    async fn dump(&self, ifname: &str) -> Result<Vec<PeerStatus>, Error> {
        self.check_device(ifname)?;
        let s = self.state.lock().unwrap();
        fail(&s.fail_on, "dump")?;
        Ok(s.devices
            .get(ifname)
            .map(|d| {
                d.peers
                    .iter()
                    .map(|p| PeerStatus {
                        public_key: p.public_key.clone(),
                        last_handshake_ms: s.handshakes.get(&p.public_key).copied().unwrap_or(0) * 1000,
                        tx_bytes: 0,
                        rx_bytes: 0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// MockIptablesOps
// ============================================================================

const BUILTIN_CHAINS: [&str; 5] = ["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

#[derive(Debug, Default)]
pub struct IptablesState {
    /// (table, chain) -> rules in order.
    pub chains: HashMap<(String, String), Vec<String>>,
    /// Entries are `op` or `op:chain`.
    pub fail_on: HashSet<String>,
}

impl IptablesState {
    pub fn failing(op: &str) -> Self {
        IptablesState {
            fail_on: HashSet::from([op.to_string()]),
            ..Default::default()
        }
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn check_fail(&self, op: &str, chain: &str) -> IptablesResult<()> {
        if self.fail_on.contains(op) || self.fail_on.contains(&format!("{op}:{chain}")) {
            return Err(format!("injected {op} failure on {chain}").into());
        }
        Ok(())
    }

    /// Built-in chains always exist; user chains only after `new_chain`.
    fn chain_mut(&mut self, table: &str, chain: &str) -> IptablesResult<&mut Vec<String>> {
        let key = (table.to_string(), chain.to_string());
        if BUILTIN_CHAINS.contains(&chain) {
            return Ok(self.chains.entry(key).or_default());
        }
        self.chains
            .get_mut(&key)
            .ok_or_else(|| format!("No chain/target/match by that name: {table}/{chain}").into())
    }
}

#[derive(Clone)]
pub struct MockIptablesOps {
    ipv6: bool,
    pub state: Arc<Mutex<IptablesState>>,
}

impl MockIptablesOps {
    pub fn new(ipv6: bool) -> Self {
        Self::with_state(ipv6, IptablesState::default())
    }

    pub fn with_state(ipv6: bool, state: IptablesState) -> Self {
        Self {
            ipv6,
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl IptablesOps for MockIptablesOps {
    fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    fn chain_exists(&self, table: &str, chain: &str) -> IptablesResult<bool> {
        let s = self.state.lock().unwrap();
        s.check_fail("chain_exists", chain)?;
        Ok(BUILTIN_CHAINS.contains(&chain) || s.chains.contains_key(&(table.to_string(), chain.to_string())))
    }

    fn new_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("new_chain", chain)?;
        let key = (table.to_string(), chain.to_string());
        if s.chains.contains_key(&key) {
            return Err(format!("Chain already exists: {table}/{chain}").into());
        }
        s.chains.insert(key, Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("flush_chain", chain)?;
        s.chain_mut(table, chain)?.clear();
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete_chain", chain)?;
        if s.chains.remove(&(table.to_string(), chain.to_string())).is_none() {
            return Err(format!("No chain by that name: {table}/{chain}").into());
        }
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("append", chain)?;
        s.chain_mut(table, chain)?.push(rule.to_string());
        Ok(())
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("insert", chain)?;
        let rules = s.chain_mut(table, chain)?;
        // iptables positions are 1-based
        let index = usize::try_from(position.max(1) - 1).unwrap_or(0).min(rules.len());
        rules.insert(index, rule.to_string());
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("delete", chain)?;
        let rules = s.chain_mut(table, chain)?;
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return Err(format!("Bad rule (does a matching rule exist in that chain?): {rule}").into());
        };
        rules.remove(pos);
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<bool> {
        let s = self.state.lock().unwrap();
        s.check_fail("exists", chain)?;
        Ok(s.chains
            .get(&(table.to_string(), chain.to_string()))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }
}

// ============================================================================
// MockDnsOps
// ============================================================================

#[derive(Debug, Default)]
pub struct DnsState {
    pub resolvers: HashMap<String, Vec<IpAddr>>,
    pub set_calls: usize,
    pub restore_calls: usize,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockDnsOps {
    pub state: Arc<Mutex<DnsState>>,
}

impl MockDnsOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolvers(&self, ifname: &str) -> Vec<IpAddr> {
        self.state
            .lock()
            .unwrap()
            .resolvers
            .get(ifname)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of mutating calls made so far.
    pub fn mutations(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.set_calls + s.restore_calls
    }
}

#[async_trait]
impl DnsOps for MockDnsOps {
    async fn set_resolvers(&self, ifname: &str, servers: &[IpAddr]) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "set_resolvers")?;
        s.set_calls += 1;
        s.resolvers.insert(ifname.to_string(), servers.to_vec());
        Ok(())
    }

    async fn restore_resolvers(&self, ifname: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        fail(&s.fail_on, "restore_resolvers")?;
        s.restore_calls += 1;
        s.resolvers.remove(ifname);
        Ok(())
    }
}

// ============================================================================
// MockWireguardUtils
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct MockPeer {
    pub public_key: PublicKey,
    pub hop_type: HopType,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpAddress>,
}

pub const MOCK_TUNNEL_INDEX: u32 = 9;

#[derive(Debug, Default)]
pub struct WireguardState {
    pub device: Option<DeviceConfig>,
    /// Index the backend has resolved, unknown for an adopted device until
    /// its existence is checked.
    pub index: Option<u32>,
    pub peers: Vec<MockPeer>,
    pub routes: BTreeSet<IpAddress>,
    /// Handshake timestamps reported by `get_peer_status`, in milliseconds.
    pub handshakes: HashMap<PublicKey, u64>,
    pub counters: Option<(u64, u64)>,
    /// Names of every trait method invoked, in order.
    pub calls: Vec<String>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockWireguardUtils {
    pub state: Arc<Mutex<WireguardState>>,
}

impl MockWireguardUtils {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(op.to_string(), format!("injected {op} failure"));
    }

    /// A device left behind by a previous daemon run.
    pub fn adopt(&self, device: DeviceConfig) {
        self.state.lock().unwrap().device = Some(device);
    }

    pub fn handshake(&self, key: &PublicKey, at_ms: u64) {
        self.state.lock().unwrap().handshakes.insert(key.clone(), at_ms);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn peers(&self) -> Vec<MockPeer> {
        self.state.lock().unwrap().peers.clone()
    }

    pub fn routes(&self) -> Vec<IpAddress> {
        self.state.lock().unwrap().routes.iter().copied().collect()
    }

    fn enter(&self, op: &str) -> Result<std::sync::MutexGuard<'_, WireguardState>, wireguard::Error> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(op.to_string());
        fail(&s.fail_on, op)?;
        Ok(s)
    }
}

#[async_trait]
impl WireguardUtils for MockWireguardUtils {
    async fn interface_exists(&mut self) -> bool {
        let mut s = self.state.lock().unwrap();
        s.index = s.device.as_ref().map(|_| MOCK_TUNNEL_INDEX);
        s.device.is_some()
    }

    async fn add_interface(&mut self, device: &DeviceConfig) -> Result<(), wireguard::Error> {
        let mut s = self.enter("add_interface")?;
        s.device = Some(device.clone());
        s.index = Some(MOCK_TUNNEL_INDEX);
        Ok(())
    }

    async fn update_peer(&mut self, config: &InterfaceConfig, endpoint: SocketAddr) -> Result<(), wireguard::Error> {
        let mut s = self.enter("update_peer")?;
        if s.device.is_none() {
            return Err(wireguard::Error::NoInterface("moz0".into()));
        }
        s.peers.retain(|p| p.public_key != config.server_public_key);
        s.peers.push(MockPeer {
            public_key: config.server_public_key.clone(),
            hop_type: config.hop_type,
            endpoint,
            allowed_ips: config.peer_allowed_ips(),
        });
        Ok(())
    }

    async fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<(), wireguard::Error> {
        let mut s = self.enter("delete_peer")?;
        s.peers.retain(|p| p.public_key != config.server_public_key);
        Ok(())
    }

    async fn delete_interface(&mut self) -> Result<(), wireguard::Error> {
        let mut s = self.enter("delete_interface")?;
        s.device = None;
        s.index = None;
        s.peers.clear();
        s.routes.clear();
        Ok(())
    }

    async fn get_peer_status(&self) -> Result<Vec<PeerStatus>, wireguard::Error> {
        let s = self.state.lock().unwrap();
        fail(&s.fail_on, "get_peer_status")?;
        Ok(s.peers
            .iter()
            .map(|p| PeerStatus {
                public_key: p.public_key.clone(),
                last_handshake_ms: s.handshakes.get(&p.public_key).copied().unwrap_or(0),
                tx_bytes: 1024,
                rx_bytes: 4096,
            })
            .collect())
    }

    async fn update_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), wireguard::Error> {
        let mut s = self.enter("update_route_prefix")?;
        s.routes.insert(*prefix);
        Ok(())
    }

    async fn delete_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), wireguard::Error> {
        let mut s = self.enter("delete_route_prefix")?;
        s.routes.remove(prefix);
        Ok(())
    }

    async fn interface_counters(&self) -> Option<(u64, u64)> {
        self.state.lock().unwrap().counters
    }

    fn interface_index(&self) -> Option<u32> {
        self.state.lock().unwrap().index
    }
}

// ============================================================================
// MockSplitTunnel
// ============================================================================

#[derive(Debug, Default)]
pub struct SplitTunnelState {
    pub excluded: BTreeSet<String>,
    pub syncs: usize,
    pub calls: Vec<String>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockSplitTunnel {
    pub state: Arc<Mutex<SplitTunnelState>>,
}

impl MockSplitTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn excluded_set(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().excluded.clone()
    }

    fn enter(&self, op: &str) -> Result<std::sync::MutexGuard<'_, SplitTunnelState>, split_tunnel::Error> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(op.to_string());
        if let Some(msg) = s.fail_on.get(op) {
            return Err(split_tunnel::Error::Unsupported(msg.clone()));
        }
        Ok(s)
    }
}

#[async_trait]
impl SplitTunnel for MockSplitTunnel {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), split_tunnel::Error> {
        self.enter("exclude_cgroup")?.excluded.insert(cgroup.to_string());
        Ok(())
    }

    async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), split_tunnel::Error> {
        self.enter("reset_cgroup")?.excluded.remove(cgroup);
        Ok(())
    }

    async fn reset_all(&mut self) -> Result<(), split_tunnel::Error> {
        self.enter("reset_all")?.excluded.clear();
        Ok(())
    }

    fn excluded(&self) -> Vec<String> {
        self.state.lock().unwrap().excluded.iter().cloned().collect()
    }

    fn needs_sync(&self) -> bool {
        true
    }

    async fn sync(&mut self) -> Result<(), split_tunnel::Error> {
        self.enter("sync")?.syncs += 1;
        Ok(())
    }
}

// ============================================================================
// MockResolver
// ============================================================================

#[derive(Debug, Default)]
pub struct ResolverState {
    pub transient_failures: usize,
    pub permanent: bool,
    pub calls: usize,
    pub hosts: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct MockResolver {
    addr: SocketAddr,
    pub state: Arc<Mutex<ResolverState>>,
}

impl MockResolver {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Arc::new(Mutex::new(ResolverState::default())),
        }
    }

    /// The next `n` lookups fail with a retryable error.
    pub fn fail_transient(&self, n: usize) {
        self.state.lock().unwrap().transient_failures = n;
    }

    pub fn fail_permanent(&self) {
        self.state.lock().unwrap().permanent = true;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl EndpointResolver for MockResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, endpoint::Error> {
        let mut s = self.state.lock().unwrap();
        s.calls += 1;
        *s.hosts.entry(host.to_string()).or_default() += 1;
        if s.permanent {
            return Err(endpoint::Error::Permanent {
                host: host.to_string(),
                reason: "Name or service not known".into(),
            });
        }
        if s.transient_failures > 0 {
            s.transient_failures -= 1;
            return Err(endpoint::Error::Transient {
                host: host.to_string(),
                reason: "Temporary failure in name resolution".into(),
            });
        }
        Ok(SocketAddr::new(self.addr.ip(), port))
    }
}
