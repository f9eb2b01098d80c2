//! Desired tunnel state handed to the daemon by the unprivileged client.
//!
//! The wire representation ([`ActivateRequest`], [`InitializeRequest`]) is
//! deliberately permissive; [`InterfaceConfig`] and [`DeviceConfig`] are the
//! validated, immutable snapshots the daemon works with.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::net::IpAddr;

use crate::ip_address::{self, IpAddress};
use crate::log_output;

const KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` is not a valid WireGuard key")]
    InvalidKey { field: &'static str },
    #[error("`{field}` is not a valid IP address: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("no device address provided")]
    NoDeviceAddress,
    #[error("no server address provided")]
    NoServerAddress,
    #[error("allowed range {address}/{range} does not match its isIpv6 flag")]
    FamilyMismatch { address: String, range: u8 },
    #[error(transparent)]
    Prefix(#[from] ip_address::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HopType {
    #[default]
    SingleHop,
    MultiHopEntry,
    MultiHopExit,
}

impl HopType {
    /// Only the hop that carries user traffic to its final destination may
    /// change the system resolvers.
    pub fn overrides_dns(&self) -> bool {
        matches!(self, HopType::SingleHop | HopType::MultiHopExit)
    }
}

impl Display for HopType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            HopType::SingleHop => "SingleHop",
            HopType::MultiHopEntry => "MultiHopEntry",
            HopType::MultiHopExit => "MultiHopExit",
        };
        write!(f, "{s}")
    }
}

/// Base64 encoded Curve25519 public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(String);

/// Base64 encoded Curve25519 private key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(String);

fn decode_key(value: &str, field: &'static str) -> Result<[u8; KEY_LEN], Error> {
    let bytes = STANDARD.decode(value.trim()).map_err(|_| Error::InvalidKey { field })?;
    bytes.try_into().map_err(|_| Error::InvalidKey { field })
}

impl PublicKey {
    pub fn parse(value: &str, field: &'static str) -> Result<Self, Error> {
        decode_key(value, field)?;
        Ok(PublicKey(value.trim().to_string()))
    }

    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        PublicKey(STANDARD.encode(bytes))
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }
}

impl PrivateKey {
    pub fn parse(value: &str, field: &'static str) -> Result<Self, Error> {
        decode_key(value, field)?;
        Ok(PrivateKey(value.trim().to_string()))
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        // validated on construction
        decode_key(&self.0, "privateKey").unwrap_or([0; KEY_LEN])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey({})", log_output::key(&self.0))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrivateKey(<redacted>)")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRange {
    pub address: String,
    pub range: u8,
    pub is_ipv6: bool,
}

/// Wire form of the `activate` command payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv6_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv4_addr_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv6_addr_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv4_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv6_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_type: Option<HopType>,
    #[serde(default)]
    pub hop_index: i32,
    #[serde(default, rename = "allowedIPAddressRanges", skip_serializing_if = "Option::is_none")]
    pub allowed_ip_address_ranges: Option<Vec<AllowedRange>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpn_disabled_apps: Vec<String>,
}

/// Wire form of the `initialize` command payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ipv6_address: Option<String>,
}

/// Local side of the tunnel: key and addresses assigned to the interface.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub private_key: PrivateKey,
    pub ipv4_address: Option<IpAddress>,
    pub ipv6_address: Option<IpAddress>,
}

impl DeviceConfig {
    pub fn addresses(&self) -> impl Iterator<Item = &IpAddress> {
        self.ipv4_address.iter().chain(self.ipv6_address.iter())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceConfig {
    pub hop_type: HopType,
    pub hop_index: i32,
    pub device: DeviceConfig,
    pub server_public_key: PublicKey,
    pub server_ipv4_addr_in: Option<String>,
    pub server_ipv6_addr_in: Option<String>,
    pub server_port: u16,
    pub server_ipv4_gateway: Option<IpAddr>,
    pub server_ipv6_gateway: Option<IpAddr>,
    pub dns_server: Option<IpAddr>,
    /// Sorted by decreasing prefix length.
    pub allowed_ip_address_ranges: Vec<IpAddress>,
    pub excluded_addresses: Vec<IpAddress>,
    pub vpn_disabled_apps: Vec<String>,
}

impl InterfaceConfig {
    /// Host part of the peer endpoint; IPv4 is preferred.
    pub fn endpoint_host(&self) -> Option<&str> {
        self.server_ipv4_addr_in
            .as_deref()
            .or(self.server_ipv6_addr_in.as_deref())
    }

    /// Allowed IPs configured on the peer.
    ///
    /// Single hop and exit hops take the full default route for every family
    /// the device has an address in. Entry hops only carry the explicit ranges.
    pub fn peer_allowed_ips(&self) -> Vec<IpAddress> {
        match self.hop_type {
            HopType::SingleHop | HopType::MultiHopExit => {
                let mut ips = Vec::with_capacity(2);
                if self.device.ipv4_address.is_some() {
                    ips.push(IpAddress::default_v4());
                }
                if self.device.ipv6_address.is_some() {
                    ips.push(IpAddress::default_v6());
                }
                ips
            }
            HopType::MultiHopEntry => self.allowed_ip_address_ranges.clone(),
        }
    }

    /// Resolvers to configure. When the DNS server is the VPN gateway the IPv6
    /// gateway is added too; a user supplied server stands alone.
    pub fn dns_resolvers(&self) -> Vec<IpAddr> {
        let Some(dns) = self.dns_server else {
            return Vec::new();
        };
        let mut resolvers = vec![dns];
        if Some(dns) == self.server_ipv4_gateway {
            if let Some(v6) = self.server_ipv6_gateway {
                resolvers.push(v6);
            }
        }
        resolvers
    }

    /// A running hop can move to `other` without rebuilding the interface.
    pub fn supports_server_switching(&self, other: &InterfaceConfig) -> bool {
        self.hop_type == other.hop_type
            && self.device == other.device
            && self.server_ipv4_gateway == other.server_ipv4_gateway
            && self.server_ipv6_gateway == other.server_ipv6_gateway
    }
}

fn parse_ip(value: &Option<String>, field: &'static str) -> Result<Option<IpAddr>, Error> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.trim().parse::<IpAddr>().map_err(|_| Error::InvalidAddress {
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn parse_prefix(value: &Option<String>, field: &'static str) -> Result<Option<IpAddress>, Error> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<IpAddress>().map_err(|_| Error::InvalidAddress {
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).map(|v| v.trim().to_string())
}

impl TryFrom<InitializeRequest> for DeviceConfig {
    type Error = Error;

    fn try_from(req: InitializeRequest) -> Result<Self, Self::Error> {
        let private_key = req.private_key.as_deref().ok_or(Error::MissingField("privateKey"))?;
        let device = DeviceConfig {
            private_key: PrivateKey::parse(private_key, "privateKey")?,
            ipv4_address: parse_prefix(&req.device_ipv4_address, "deviceIpv4Address")?,
            ipv6_address: parse_prefix(&req.device_ipv6_address, "deviceIpv6Address")?,
        };
        if device.ipv4_address.is_none() && device.ipv6_address.is_none() {
            return Err(Error::NoDeviceAddress);
        }
        Ok(device)
    }
}

impl TryFrom<ActivateRequest> for InterfaceConfig {
    type Error = Error;

    fn try_from(req: ActivateRequest) -> Result<Self, Self::Error> {
        let device = DeviceConfig::try_from(InitializeRequest {
            private_key: req.private_key.clone(),
            device_ipv4_address: req.device_ipv4_address.clone(),
            device_ipv6_address: req.device_ipv6_address.clone(),
        })?;

        let server_public_key = req
            .server_public_key
            .as_deref()
            .ok_or(Error::MissingField("serverPublicKey"))?;
        let server_public_key = PublicKey::parse(server_public_key, "serverPublicKey")?;
        let server_port = req.server_port.ok_or(Error::MissingField("serverPort"))?;

        let server_ipv4_addr_in = non_empty(&req.server_ipv4_addr_in);
        let server_ipv6_addr_in = non_empty(&req.server_ipv6_addr_in);
        if server_ipv4_addr_in.is_none() && server_ipv6_addr_in.is_none() {
            return Err(Error::NoServerAddress);
        }

        let ranges = req
            .allowed_ip_address_ranges
            .ok_or(Error::MissingField("allowedIPAddressRanges"))?;
        let mut allowed_ip_address_ranges = Vec::with_capacity(ranges.len());
        for range in ranges {
            let address = range
                .address
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidAddress {
                    field: "allowedIPAddressRanges",
                    value: range.address.clone(),
                })?;
            if address.is_ipv6() != range.is_ipv6 {
                return Err(Error::FamilyMismatch {
                    address: range.address,
                    range: range.range,
                });
            }
            allowed_ip_address_ranges.push(IpAddress::new(address, range.range)?);
        }
        // stable, so equal lengths keep the caller's order
        allowed_ip_address_ranges.sort_by(|a, b| b.prefix_length().cmp(&a.prefix_length()));

        let excluded_addresses = req
            .excluded_addresses
            .iter()
            .map(|v| {
                v.parse::<IpAddress>().map_err(|_| Error::InvalidAddress {
                    field: "excludedAddresses",
                    value: v.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InterfaceConfig {
            hop_type: req.hop_type.unwrap_or_default(),
            hop_index: req.hop_index,
            device,
            server_public_key,
            server_ipv4_addr_in,
            server_ipv6_addr_in,
            server_port,
            server_ipv4_gateway: parse_ip(&req.server_ipv4_gateway, "serverIpv4Gateway")?,
            server_ipv6_gateway: parse_ip(&req.server_ipv6_gateway, "serverIpv6Gateway")?,
            dns_server: parse_ip(&req.dns_server, "dnsServer")?,
            allowed_ip_address_ranges,
            excluded_addresses,
            vpn_disabled_apps: req.vpn_disabled_apps,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const PRIVATE_KEY: &str = "YEocP0e2o1WT5GlvBvQzVF7EeR6z9aCk7ANhTrnrvkM=";
    pub const SERVER_KEY: &str = "JPT1veXLmasj2uQDstX24mpR7VWD+GmV8JDkidkz91Q=";

    pub fn request(hop: HopType) -> ActivateRequest {
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
                    address: "0.0.0.0".into(),
                    range: 0,
                    is_ipv6: false,
                },
                AllowedRange {
                    address: "10.64.0.1".into(),
                    range: 32,
                    is_ipv6: false,
                },
                AllowedRange {
                    address: "10.0.0.0".into(),
                    range: 8,
                    is_ipv6: false,
                },
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn parses_complete_request_and_sorts_ranges() -> anyhow::Result<()> {
        let config = InterfaceConfig::try_from(request(HopType::SingleHop))?;
        let lens: Vec<u8> = config
            .allowed_ip_address_ranges
            .iter()
            .map(|r| r.prefix_length())
            .collect();
        assert_eq!(lens, vec![32, 8, 0]);
        assert_eq!(config.server_port, 51820);
        assert_eq!(config.endpoint_host(), Some("185.65.135.5"));
        Ok(())
    }

    #[test]
    fn rejects_missing_required_fields() -> anyhow::Result<()> {
        let mut req = request(HopType::SingleHop);
        req.server_port = None;
        assert_eq!(
            InterfaceConfig::try_from(req).expect_err("port"),
            Error::MissingField("serverPort")
        );

        let mut req = request(HopType::SingleHop);
        req.allowed_ip_address_ranges = None;
        assert_eq!(
            InterfaceConfig::try_from(req).expect_err("ranges"),
            Error::MissingField("allowedIPAddressRanges")
        );

        let mut req = request(HopType::SingleHop);
        req.device_ipv4_address = None;
        req.device_ipv6_address = None;
        assert_eq!(
            InterfaceConfig::try_from(req).expect_err("device"),
            Error::NoDeviceAddress
        );

        let mut req = request(HopType::SingleHop);
        req.server_ipv4_addr_in = Some(" ".into());
        assert_eq!(
            InterfaceConfig::try_from(req).expect_err("server"),
            Error::NoServerAddress
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_keys() -> anyhow::Result<()> {
        let mut req = request(HopType::SingleHop);
        req.server_public_key = Some("c2hvcnQ=".into());
        assert_eq!(
            InterfaceConfig::try_from(req).expect_err("short key"),
            Error::InvalidKey {
                field: "serverPublicKey"
            }
        );

        let mut req = request(HopType::SingleHop);
        req.private_key = Some("***".into());
        assert!(matches!(
            InterfaceConfig::try_from(req),
            Err(Error::InvalidKey { field: "privateKey" })
        ));
        Ok(())
    }

    #[test]
    fn rejects_family_mismatch() -> anyhow::Result<()> {
        let mut req = request(HopType::SingleHop);
        req.allowed_ip_address_ranges = Some(vec![AllowedRange {
            address: "::".into(),
            range: 0,
            is_ipv6: false,
        }]);
        assert!(matches!(
            InterfaceConfig::try_from(req),
            Err(Error::FamilyMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn single_hop_and_exit_take_the_default_route() -> anyhow::Result<()> {
        for hop in [HopType::SingleHop, HopType::MultiHopExit] {
            let config = InterfaceConfig::try_from(request(hop))?;
            let ips = config.peer_allowed_ips();
            assert!(ips.contains(&IpAddress::default_v4()));
            assert!(ips.contains(&IpAddress::default_v6()));
        }
        Ok(())
    }

    #[test]
    fn entry_hop_never_takes_the_default_route() -> anyhow::Result<()> {
        let mut req = request(HopType::MultiHopEntry);
        req.allowed_ip_address_ranges = Some(vec![AllowedRange {
            address: "185.65.135.9".into(),
            range: 32,
            is_ipv6: false,
        }]);
        let config = InterfaceConfig::try_from(req)?;
        let ips = config.peer_allowed_ips();
        assert_eq!(ips, vec!["185.65.135.9/32".parse::<IpAddress>()?]);
        assert!(ips.iter().all(|ip| !ip.is_default()));
        Ok(())
    }

    #[test]
    fn gateway_dns_adds_ipv6_gateway() -> anyhow::Result<()> {
        let config = InterfaceConfig::try_from(request(HopType::SingleHop))?;
        assert_eq!(
            config.dns_resolvers(),
            vec!["10.64.0.1".parse::<IpAddr>()?, "fc00:bbbb:bbbb:bb01::1".parse::<IpAddr>()?]
        );

        let mut req = request(HopType::SingleHop);
        req.dns_server = Some("9.9.9.9".into());
        let config = InterfaceConfig::try_from(req)?;
        assert_eq!(config.dns_resolvers(), vec!["9.9.9.9".parse::<IpAddr>()?]);
        Ok(())
    }

    #[test]
    fn server_switching_needs_same_device() -> anyhow::Result<()> {
        let current = InterfaceConfig::try_from(request(HopType::SingleHop))?;
        let mut req = request(HopType::SingleHop);
        req.server_ipv4_addr_in = Some("185.65.135.77".into());
        let next = InterfaceConfig::try_from(req)?;
        assert!(current.supports_server_switching(&next));

        let mut req = request(HopType::SingleHop);
        req.device_ipv4_address = Some("10.67.12.99/32".into());
        let other_device = InterfaceConfig::try_from(req)?;
        assert!(!current.supports_server_switching(&other_device));
        Ok(())
    }

    #[test]
    fn private_key_is_never_printed() -> anyhow::Result<()> {
        let config = InterfaceConfig::try_from(request(HopType::SingleHop))?;
        let debug = format!("{config:?}");
        assert!(!debug.contains(PRIVATE_KEY));
        Ok(())
    }
}
