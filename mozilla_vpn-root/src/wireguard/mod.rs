//! WireGuard interface lifecycle.
//!
//! [`WireguardUtils`] is the one capability the controller uses to create the
//! tunnel device, manage its peer table and install the allowed-IP routes.
//! The Linux backend lives in [`linux`].

use async_trait::async_trait;
use thiserror::Error;

use std::net::SocketAddr;

use mozilla_vpn_lib::interface_config::{DeviceConfig, InterfaceConfig, PrivateKey, PublicKey};
use mozilla_vpn_lib::ip_address::IpAddress;

use crate::routing;

pub mod endpoint;
#[cfg(target_os = "linux")]
pub mod linux;

/// Persistent keepalive for every peer, in seconds.
pub const KEEPALIVE_SECS: u16 = 60;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error("interface {0} exists but is not a WireGuard device")]
    NotWireguard(String),
    #[error("tunnel interface {0} does not exist")]
    NoInterface(String),
    #[error("WireGuard tooling is not installed")]
    ToolingMissing,
}

/// Live statistics of one peer, as reported by the kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerStatus {
    pub public_key: PublicKey,
    /// Milliseconds since the epoch, 0 before the first handshake.
    pub last_handshake_ms: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[async_trait]
pub trait WireguardUtils: Send + Sync {
    /// True only for a WireGuard link carrying the tunnel name. Also
    /// refreshes [`WireguardUtils::interface_index`], so an interface left by
    /// a previous daemon run is known by index from here on.
    async fn interface_exists(&mut self) -> bool;
    /// Creates and configures the device. Nothing is left behind on failure.
    async fn add_interface(&mut self, device: &DeviceConfig) -> Result<(), Error>;
    /// Installs or replaces the peer described by `config`.
    async fn update_peer(&mut self, config: &InterfaceConfig, endpoint: SocketAddr) -> Result<(), Error>;
    /// Absent peers count as removed.
    async fn delete_peer(&mut self, config: &InterfaceConfig) -> Result<(), Error>;
    /// Absent interfaces count as removed.
    async fn delete_interface(&mut self) -> Result<(), Error>;
    /// Empty when the interface does not exist.
    async fn get_peer_status(&self) -> Result<Vec<PeerStatus>, Error>;
    async fn update_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), Error>;
    async fn delete_route_prefix(&mut self, prefix: &IpAddress) -> Result<(), Error>;
    /// `(tx_bytes, rx_bytes)` of the whole interface.
    async fn interface_counters(&self) -> Option<(u64, u64)>;
    /// Kernel index while the interface exists.
    fn interface_index(&self) -> Option<u32>;
}

/// Curve25519 public key belonging to `private`.
pub fn derive_public_key(private: &PrivateKey) -> PublicKey {
    let secret = x25519_dalek::StaticSecret::from(private.to_bytes());
    let public = x25519_dalek::PublicKey::from(&secret);
    PublicKey::from_bytes(public.as_bytes())
}
