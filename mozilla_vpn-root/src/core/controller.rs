//! Tunnel orchestration.
//!
//! The controller exclusively owns the platform capabilities and the slot of
//! the currently active connection. Everything here runs on the control loop
//! one call at a time; the only slow step, endpoint resolution, happens in a
//! runner before [`Controller::activate`] is called.

use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mozilla_vpn_lib::command::{Response, StatusResponse};
use mozilla_vpn_lib::config::Config;
use mozilla_vpn_lib::interface_config::{DeviceConfig, InterfaceConfig, PublicKey};
use mozilla_vpn_lib::ip_address::IpAddress;
use mozilla_vpn_lib::log_output::{self, Sensitive};
use mozilla_vpn_lib::settings::{self, KEY_CONNECTION_UUID, KEY_EXCLUDED_CGROUPS, Settings};

use crate::routing::dns_ops::DnsOps;
use crate::routing::netlink_ops::NetlinkOps;
use crate::routing::route_monitor::RouteMonitor;
use crate::routing::{self, teardown_op};
use crate::split_tunnel::{self, SplitTunnel};
use crate::wireguard::{self, WireguardUtils};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Wireguard(#[from] wireguard::Error),
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error(transparent)]
    SplitTunnel(#[from] split_tunnel::Error),
    #[error("Settings error: {0}")]
    Settings(#[from] settings::Error),
}

/// Result of a successful [`Controller::activate`].
#[derive(Clone, Debug, PartialEq)]
pub enum Activated {
    /// Same hop, same server and handshaken: nothing was touched.
    AlreadyConnected(PublicKey),
    /// Peer configured, waiting for the first handshake.
    Pending,
}

/// Outcome of one handshake poll.
#[derive(Debug, Default, PartialEq)]
pub struct HandshakeCheck {
    pub events: Vec<Response>,
    /// No hop is waiting any more.
    pub done: bool,
}

#[derive(Clone, Debug)]
struct Hop {
    config: InterfaceConfig,
    endpoint: SocketAddr,
    connected: bool,
}

/// Everything installed on behalf of the tunnel that is currently up.
#[derive(Debug)]
struct ActiveConnection {
    hops: BTreeMap<i32, Hop>,
    exclusions: BTreeSet<IpAddress>,
    connected_at: Option<SystemTime>,
    handshake_since: Instant,
}

impl ActiveConnection {
    fn new() -> Self {
        ActiveConnection {
            hops: BTreeMap::new(),
            exclusions: BTreeSet::new(),
            connected_at: None,
            handshake_since: Instant::now(),
        }
    }
}

pub struct Controller<W, D, N: NetlinkOps> {
    ifname: String,
    handshake_timeout: Duration,
    default_route_capture: bool,
    wg: W,
    dns: D,
    routes: RouteMonitor<N>,
    split: Box<dyn SplitTunnel>,
    settings: Box<dyn Settings>,
    active: Option<ActiveConnection>,
}

fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl<W, D, N> Controller<W, D, N>
where
    W: WireguardUtils,
    D: DnsOps,
    N: NetlinkOps,
{
    pub fn new(
        config: &Config,
        wg: W,
        dns: D,
        routes: RouteMonitor<N>,
        split: Box<dyn SplitTunnel>,
        settings: Box<dyn Settings>,
    ) -> Self {
        Controller {
            ifname: config.interface.clone(),
            handshake_timeout: config.handshake_timeout,
            default_route_capture: config.default_route_capture,
            wg,
            dns,
            routes,
            split,
            settings,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn tunnel_index(&self) -> Option<u32> {
        self.wg.interface_index()
    }

    pub fn split_tunnel_kind(&self) -> &'static str {
        self.split.kind()
    }

    /// Creates the tunnel interface unless the one recorded in the settings
    /// is still there.
    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn initialize(&mut self, device: &DeviceConfig) -> Response {
        let exists = self.wg.interface_exists().await;
        let persisted = settings::connection_uuid(self.settings.as_ref());

        let uuid = match persisted {
            Some(uuid) => uuid,
            None => {
                let uuid = uuid::Uuid::new_v4();
                if let Err(error) = self.settings.set(KEY_CONNECTION_UUID, &uuid.to_string()) {
                    tracing::error!(%error, "unable to persist connection identifier");
                    return Response::Initialized {
                        ok: false,
                        already_active: false,
                        uuid: String::new(),
                    };
                }
                uuid
            }
        };
        let already_active = exists && persisted.is_some();

        if !exists {
            if let Err(error) = self.wg.add_interface(device).await {
                tracing::error!(%error, "unable to create tunnel interface");
                if let Err(error) = self.wg.delete_interface().await {
                    tracing::warn!(%error, "failed to delete half configured interface");
                }
                return Response::Initialized {
                    ok: false,
                    already_active: false,
                    uuid: uuid.to_string(),
                };
            }
        }
        self.routes.set_tunnel_index(self.wg.interface_index());
        tracing::info!(%uuid, already_active, interface = %self.ifname, "tunnel initialized");
        Response::Initialized {
            ok: true,
            already_active,
            uuid: uuid.to_string(),
        }
    }

    /// Brings one hop up. On failure everything installed for the connection
    /// is removed again.
    #[tracing::instrument(skip_all, level = "debug", fields(hop = config.hop_index, hop_type = %config.hop_type))]
    pub async fn activate(&mut self, config: InterfaceConfig, endpoint: SocketAddr) -> Result<Activated, Error> {
        let previous = self
            .active
            .as_ref()
            .and_then(|a| a.hops.get(&config.hop_index))
            .cloned();

        if let Some(hop) = &previous {
            if hop.connected && hop.config == config && hop.endpoint == endpoint {
                tracing::info!("hop already connected");
                return Ok(Activated::AlreadyConnected(config.server_public_key));
            }
        }

        let other_device = self
            .active
            .as_ref()
            .is_some_and(|a| a.hops.values().any(|h| h.config.device != config.device));
        if other_device {
            tracing::info!("device changed, rebuilding the tunnel");
            self.teardown().await;
        }

        let res = match previous {
            Some(prev) if !other_device && prev.config.supports_server_switching(&config) => {
                self.switch_server(prev.config, config, endpoint).await
            }
            Some(_) if !other_device => {
                tracing::info!("hop changed shape, rebuilding the tunnel");
                self.teardown().await;
                self.connect_hop(config, endpoint).await
            }
            _ => self.connect_hop(config, endpoint).await,
        };

        match res {
            Ok(()) => Ok(Activated::Pending),
            Err(e) => {
                tracing::error!(error = %e, "activation failed, rolling back");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn connect_hop(&mut self, config: InterfaceConfig, endpoint: SocketAddr) -> Result<(), Error> {
        if !self.wg.interface_exists().await {
            self.wg.add_interface(&config.device).await?;
        }
        self.routes.set_tunnel_index(self.wg.interface_index());

        let active = self.active.get_or_insert_with(ActiveConnection::new);
        active.handshake_since = Instant::now();
        active.hops.insert(
            config.hop_index,
            Hop {
                config: config.clone(),
                endpoint,
                connected: false,
            },
        );

        self.wg.update_peer(&config, endpoint).await?;
        for prefix in config.allowed_ip_address_ranges.iter() {
            self.wg.update_route_prefix(prefix).await?;
        }
        self.routes.set_tunnel_index(self.wg.interface_index());
        self.add_exclusions(&config.excluded_addresses).await?;
        if self.default_route_capture && !self.routes.capture_enabled() {
            self.routes.set_default_route_capture(true).await?;
        }
        self.apply_dns(&config).await?;

        tracing::info!(
            server = %log_output::key(config.server_public_key.as_base64()),
            endpoint = %Sensitive(endpoint),
            "hop configured, waiting for handshake"
        );
        Ok(())
    }

    /// Moves a running hop to another server without touching the device.
    async fn switch_server(
        &mut self,
        previous: InterfaceConfig,
        config: InterfaceConfig,
        endpoint: SocketAddr,
    ) -> Result<(), Error> {
        tracing::info!(
            from = %log_output::key(previous.server_public_key.as_base64()),
            to = %log_output::key(config.server_public_key.as_base64()),
            "switching server"
        );
        if let Some(active) = self.active.as_mut() {
            active.handshake_since = Instant::now();
            active.hops.insert(
                config.hop_index,
                Hop {
                    config: config.clone(),
                    endpoint,
                    connected: false,
                },
            );
        }

        self.wg.update_peer(&config, endpoint).await?;
        for prefix in config.allowed_ip_address_ranges.iter() {
            if !previous.allowed_ip_address_ranges.contains(prefix) {
                self.wg.update_route_prefix(prefix).await?;
            }
        }
        for prefix in previous.allowed_ip_address_ranges.iter() {
            if !config.allowed_ip_address_ranges.contains(prefix) {
                self.wg.delete_route_prefix(prefix).await?;
            }
        }
        if previous.server_public_key != config.server_public_key {
            self.wg.delete_peer(&previous).await?;
        }

        let stale: Vec<IpAddress> = previous
            .excluded_addresses
            .iter()
            .filter(|p| !config.excluded_addresses.contains(p))
            .copied()
            .collect();
        for prefix in stale {
            self.routes.delete_exclusion_route(&prefix).await?;
            if let Some(active) = self.active.as_mut() {
                active.exclusions.remove(&prefix);
            }
        }
        self.add_exclusions(&config.excluded_addresses).await?;
        self.apply_dns(&config).await
    }

    async fn add_exclusions(&mut self, prefixes: &[IpAddress]) -> Result<(), Error> {
        for prefix in prefixes {
            match self.routes.add_exclusion_route(*prefix).await {
                Ok(()) | Err(routing::Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(active) = self.active.as_mut() {
                active.exclusions.insert(*prefix);
            }
        }
        Ok(())
    }

    /// Entry hops never override the system resolvers.
    async fn apply_dns(&self, config: &InterfaceConfig) -> Result<(), Error> {
        if !config.hop_type.overrides_dns() {
            return Ok(());
        }
        let resolvers = config.dns_resolvers();
        if resolvers.is_empty() {
            return Ok(());
        }
        self.dns.set_resolvers(&self.ifname, &resolvers).await?;
        tracing::debug!(resolvers = ?Sensitive(&resolvers), "resolvers applied");
        Ok(())
    }

    /// Takes the tunnel down. Without an active connection the kernel is not
    /// touched at all.
    pub async fn deactivate(&mut self) -> Response {
        if self.active.is_none() {
            tracing::debug!("no active connection, nothing to deactivate");
        } else {
            self.teardown().await;
            tracing::info!("tunnel deactivated");
        }
        Response::Disconnected
    }

    /// Best effort removal of everything the active connection installed.
    /// The slot is cleared regardless of individual failures.
    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        for hop in active.hops.values().rev() {
            for prefix in hop.config.allowed_ip_address_ranges.iter() {
                if let Err(error) = self.wg.delete_route_prefix(prefix).await {
                    tracing::warn!(%error, %prefix, "failed to delete allowed-IP route, continuing anyway");
                }
            }
            if let Err(error) = self.wg.delete_peer(&hop.config).await {
                tracing::warn!(%error, "failed to delete peer, continuing anyway");
            }
            if hop.config.hop_type.overrides_dns() && hop.config.dns_server.is_some() {
                teardown_op("restore resolvers", || self.dns.restore_resolvers(&self.ifname)).await;
            }
        }
        for prefix in active.exclusions.iter() {
            if let Err(error) = self.routes.delete_exclusion_route(prefix).await {
                tracing::warn!(%error, %prefix, "failed to delete exclusion route, continuing anyway");
            }
        }
        if self.routes.capture_enabled() {
            if let Err(error) = self.routes.set_default_route_capture(false).await {
                tracing::warn!(%error, "failed to disable route capture, continuing anyway");
            }
        }
        if let Err(error) = self.wg.delete_interface().await {
            tracing::warn!(%error, "failed to delete tunnel interface, continuing anyway");
        }
        self.routes.set_tunnel_index(None);
    }

    /// Statistics of the first hop present in the kernel peer table.
    pub async fn status(&self) -> StatusResponse {
        let Some(active) = &self.active else {
            return StatusResponse::default();
        };
        let peers = match self.wg.get_peer_status().await {
            Ok(peers) => peers,
            Err(error) => {
                tracing::warn!(%error, "unable to read peer status");
                Vec::new()
            }
        };

        let found = active.hops.values().find_map(|hop| {
            peers
                .iter()
                .find(|p| p.public_key == hop.config.server_public_key)
                .map(|p| (hop, p.tx_bytes, p.rx_bytes))
        });
        let (hop, tx_bytes, rx_bytes) = match found {
            Some(found) => found,
            None if peers.is_empty() => {
                let (Some(hop), Some((tx, rx))) =
                    (active.hops.values().next(), self.wg.interface_counters().await)
                else {
                    return StatusResponse::default();
                };
                (hop, tx, rx)
            }
            None => return StatusResponse::default(),
        };

        StatusResponse {
            connected: true,
            server_ipv4_gateway: hop.config.server_ipv4_gateway.map(|ip| ip.to_string()),
            device_ipv4_address: hop.config.device.ipv4_address.map(|ip| ip.to_string()),
            date: active.connected_at.map(epoch_ms),
            tx_bytes,
            rx_bytes,
        }
    }

    /// Marks hops whose peer completed a handshake as connected, and gives up
    /// on all waiting hops once the handshake timeout has passed.
    pub async fn check_handshakes(&mut self, now: Instant) -> HandshakeCheck {
        let peers = match self.wg.get_peer_status().await {
            Ok(peers) => peers,
            Err(error) => {
                tracing::warn!(%error, "unable to read peer status");
                Vec::new()
            }
        };
        let Some(active) = self.active.as_mut() else {
            return HandshakeCheck {
                events: Vec::new(),
                done: true,
            };
        };

        let mut events = Vec::new();
        for hop in active.hops.values_mut().filter(|h| !h.connected) {
            let handshaken = peers
                .iter()
                .any(|p| p.public_key == hop.config.server_public_key && p.last_handshake_ms > 0);
            if handshaken {
                hop.connected = true;
                tracing::info!(hop = hop.config.hop_index, "handshake completed");
                events.push(Response::Connected {
                    pubkey: hop.config.server_public_key.to_string(),
                });
            }
        }
        if !events.is_empty() && active.connected_at.is_none() {
            active.connected_at = Some(SystemTime::now());
        }

        if active.hops.values().all(|h| h.connected) {
            return HandshakeCheck { events, done: true };
        }
        if now.saturating_duration_since(active.handshake_since) >= self.handshake_timeout {
            for hop in active.hops.values().filter(|h| !h.connected) {
                tracing::warn!(hop = hop.config.hop_index, "no handshake within timeout");
                events.push(Response::HandshakeFailed {
                    pubkey: hop.config.server_public_key.to_string(),
                });
            }
            return HandshakeCheck { events, done: true };
        }
        HandshakeCheck { events, done: false }
    }

    pub async fn route_changed(&mut self) {
        if let Err(error) = self.routes.route_changed().await {
            tracing::warn!(%error, "failed to converge routes after change");
        }
    }

    pub async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        self.split.exclude_cgroup(cgroup).await?;
        self.persist_excluded()
    }

    pub async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        self.split.reset_cgroup(cgroup).await?;
        self.persist_excluded()
    }

    pub async fn reset_all_cgroups(&mut self) -> Result<(), Error> {
        self.split.reset_all().await?;
        self.persist_excluded()
    }

    /// True while excluded cgroups must be re-synced periodically.
    pub fn split_tunnel_needs_sync(&self) -> bool {
        self.split.needs_sync() && !self.split.excluded().is_empty()
    }

    pub async fn sync_split_tunnel(&mut self) {
        if let Err(error) = self.split.sync().await {
            tracing::warn!(%error, "unable to sync excluded cgroups");
        }
    }

    fn persist_excluded(&mut self) -> Result<(), Error> {
        let excluded = self.split.excluded();
        self.settings.set_list(KEY_EXCLUDED_CGROUPS, &excluded)?;
        Ok(())
    }

    /// Undoes exclusions left behind by a previous daemon run that did not
    /// shut down cleanly.
    pub async fn restore_split_tunnel(&mut self) {
        let stale = self.settings.get_list(KEY_EXCLUDED_CGROUPS);
        for cgroup in stale.iter() {
            if let Err(error) = self.split.reset_cgroup(cgroup).await {
                tracing::warn!(%error, cgroup, "unable to reset stale cgroup exclusion");
            }
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "reset stale cgroup exclusions");
        }
        if let Err(error) = self.persist_excluded() {
            tracing::warn!(%error, "unable to persist excluded cgroups");
        }
    }

    /// Leaves no tunnel state behind.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.routes.shutdown().await;
        if let Err(error) = self.reset_all_cgroups().await {
            tracing::warn!(%error, "unable to reset excluded cgroups");
        }
    }
}
