use cidr::IpInet;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid prefix `{0}`")]
    Parse(String),
    #[error("prefix length {len} exceeds {max} for {address}")]
    PrefixTooLong { address: IpAddr, len: u8, max: u8 },
}

/// An IP prefix: network address plus prefix length.
///
/// Host bits are always cleared on construction, so two values describing the
/// same network compare equal and hash identically. Ordering sorts IPv4 before
/// IPv6, then by address, then by prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct IpAddress {
    address: IpAddr,
    prefix_len: u8,
}

impl IpAddress {
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, Error> {
        let max = max_prefix_length(&address);
        let inet = IpInet::new(address, prefix_len).map_err(|_| Error::PrefixTooLong {
            address,
            len: prefix_len,
            max,
        })?;
        Ok(IpAddress {
            address: inet.network().first_address(),
            prefix_len,
        })
    }

    /// Single address prefix (/32 or /128).
    pub fn host(address: IpAddr) -> Self {
        IpAddress {
            address,
            prefix_len: max_prefix_length(&address),
        }
    }

    pub fn default_v4() -> Self {
        IpAddress {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    pub fn default_v6() -> Self {
        IpAddress {
            address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_length(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    pub fn is_host(&self) -> bool {
        self.prefix_len == max_prefix_length(&self.address)
    }

    pub fn same_family(&self, other: &IpAddress) -> bool {
        self.is_ipv4() == other.is_ipv4()
    }

    /// Whether `addr` lies inside this prefix.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = mask_u32(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*a) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = mask_u128(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*a) & mask)
            }
            _ => false,
        }
    }

    /// Whether every address of `other` is also inside this prefix.
    pub fn covers(&self, other: &IpAddress) -> bool {
        self.same_family(other) && self.prefix_len <= other.prefix_len && self.contains(&other.address)
    }

    /// Loopback, broadcast, link-local or multicast destinations.
    pub fn is_special(&self) -> bool {
        match self.address {
            IpAddr::V4(a) => a.is_loopback() || a.is_broadcast() || a.is_link_local() || a.is_multicast(),
            IpAddr::V6(a) => a.is_loopback() || a.is_multicast() || (a.segments()[0] & 0xffc0) == 0xfe80,
        }
    }
}

pub fn max_prefix_length(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_u32(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len.min(32))) }
}

fn mask_u128(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - u32::from(len.min(128))) }
}

impl Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cidr = cidr::parsers::parse_cidr_ignore_hostbits::<cidr::IpCidr, _>(s.trim(), IpAddr::from_str)
            .map_err(|_| Error::Parse(s.to_string()))?;
        Ok(IpAddress {
            address: cidr.first_address(),
            prefix_len: cidr.network_length(),
        })
    }
}

impl From<IpAddr> for IpAddress {
    fn from(address: IpAddr) -> Self {
        IpAddress::host(address)
    }
}
