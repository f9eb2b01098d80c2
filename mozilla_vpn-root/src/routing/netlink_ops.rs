//! Abstraction over rtnetlink operations for testability.
//!
//! Defines [`NetlinkOps`] and the domain types ([`RouteSpec`], [`RuleSpec`],
//! [`LinkInfo`]) that decouple the routing logic from the raw netlink wire
//! format. Both address families go through the same types.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo as NlLinkInfo, LinkMessage};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteType};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleFlags, RuleMessage};
use rtnetlink::{IpVersion, RouteMessageBuilder};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use mozilla_vpn_lib::ip_address::IpAddress;

use super::{Error, MAIN_TABLE, MARKER_METRIC, MARKER_PROTOCOL};

// ============================================================================
// Domain Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    /// Ends the lookup in the current table; the next policy rule is tried.
    Throw,
    Other,
}

/// Route specification decoupled from rtnetlink wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub destination: IpAddress,
    pub gateway: Option<IpAddr>,
    pub if_index: Option<u32>,
    pub table_id: u32,
    pub metric: Option<u32>,
    pub protocol: u8,
    pub kind: RouteKind,
}

impl RouteSpec {
    pub fn unicast(destination: IpAddress, table_id: u32) -> Self {
        RouteSpec {
            destination,
            gateway: None,
            if_index: None,
            table_id,
            metric: None,
            protocol: 0,
            kind: RouteKind::Unicast,
        }
    }

    pub fn throw(destination: IpAddress, table_id: u32) -> Self {
        RouteSpec {
            kind: RouteKind::Throw,
            ..RouteSpec::unicast(destination, table_id)
        }
    }

    /// Tag the route as installed by the route monitor.
    pub fn marked(self) -> Self {
        RouteSpec {
            protocol: MARKER_PROTOCOL,
            metric: Some(MARKER_METRIC),
            ..self
        }
    }

    pub fn is_marked(&self) -> bool {
        self.protocol == MARKER_PROTOCOL && self.metric == Some(MARKER_METRIC)
    }

    /// Kernel identity of a route: two specs with the same key cannot coexist.
    pub fn same_key(&self, other: &RouteSpec) -> bool {
        self.destination == other.destination
            && self.table_id == other.table_id
            && self.metric.unwrap_or(0) == other.metric.unwrap_or(0)
    }
}

/// Policy routing rule specification.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub v6: bool,
    pub fw_mark: u32,
    /// Match packets *not* carrying `fw_mark`.
    pub invert: bool,
    pub destination: Option<IpAddress>,
    pub table_id: u32,
    pub priority: Option<u32>,
}

impl RuleSpec {
    pub fn same_key(&self, other: &RuleSpec) -> bool {
        self.v6 == other.v6
            && self.fw_mark == other.fw_mark
            && self.invert == other.invert
            && self.destination == other.destination
            && self.table_id == other.table_id
    }
}

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub is_wireguard: bool,
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink route/rule/link/address operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Routes of one family living in `table_id`.
    async fn route_list(&self, v6: bool, table_id: u32) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, v6: bool) -> Result<Vec<RuleSpec>, Error>;

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn link_del(&self, index: u32) -> Result<(), Error>;
    async fn addr_add(&self, index: u32, address: &IpAddress) -> Result<(), Error>;

    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, Error> {
        let links = self.link_list().await?;
        Ok(links.into_iter().find(|l| l.name == name))
    }
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        match (spec.destination.address(), spec.gateway) {
            (IpAddr::V4(dst), gw) => {
                let mut builder =
                    RouteMessageBuilder::<Ipv4Addr>::new().destination_prefix(dst, spec.destination.prefix_length());
                if let Some(IpAddr::V4(gw)) = gw {
                    builder = builder.gateway(gw);
                }
                Self::finish_route(builder, spec)
            }
            (IpAddr::V6(dst), gw) => {
                let mut builder =
                    RouteMessageBuilder::<Ipv6Addr>::new().destination_prefix(dst, spec.destination.prefix_length());
                if let Some(IpAddr::V6(gw)) = gw {
                    builder = builder.gateway(gw);
                }
                Self::finish_route(builder, spec)
            }
        }
    }

    fn finish_route<T>(mut builder: RouteMessageBuilder<T>, spec: &RouteSpec) -> RouteMessage {
        if let Some(idx) = spec.if_index {
            builder = builder.output_interface(idx);
        }
        if let Some(metric) = spec.metric {
            builder = builder.priority(metric);
        }
        let kind = match spec.kind {
            RouteKind::Throw => RouteType::Throw,
            _ => RouteType::Unicast,
        };
        builder
            .table_id(spec.table_id)
            .protocol(RouteProtocol::from(spec.protocol))
            .kind(kind)
            .build()
    }

    pub(crate) fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
        let family_v6 = msg.header.address_family == rtnetlink::packet_route::AddressFamily::Inet6;
        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                _ => None,
            })
            .unwrap_or(if family_v6 {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });
        let destination = IpAddress::new(destination, msg.header.destination_prefix_length).ok()?;

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });
        let table_id = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(u32::from(msg.header.table));
        let metric = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Priority(p) => Some(*p),
            _ => None,
        });
        let kind = match msg.header.kind {
            RouteType::Unicast => RouteKind::Unicast,
            RouteType::Throw => RouteKind::Throw,
            _ => RouteKind::Other,
        };

        Some(RouteSpec {
            destination,
            gateway,
            if_index,
            table_id,
            metric,
            protocol: u8::from(msg.header.protocol),
            kind,
        })
    }

    fn rule_message_to_spec(v6: bool, msg: &RuleMessage) -> Option<RuleSpec> {
        let fw_mark = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::FwMark(m) => Some(*m),
            _ => None,
        })?;
        let table_id = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Table(t) => Some(*t),
                _ => None,
            })
            .unwrap_or(u32::from(msg.header.table));
        let priority = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::Priority(p) => Some(*p),
            _ => None,
        });
        let destination = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::Destination(ip) => IpAddress::new(*ip, msg.header.dst_len).ok(),
            _ => None,
        });

        Some(RuleSpec {
            v6,
            fw_mark,
            invert: msg.header.flags.contains(RuleFlags::Invert),
            destination,
            table_id,
            priority,
        })
    }

    pub(crate) fn link_message_to_info(link: &LinkMessage) -> Option<LinkInfo> {
        let name = link.attributes.iter().find_map(|a| match a {
            LinkAttribute::IfName(n) => Some(n.clone()),
            _ => None,
        })?;
        let is_wireguard = link.attributes.iter().any(|a| match a {
            LinkAttribute::LinkInfo(infos) => infos
                .iter()
                .any(|i| matches!(i, NlLinkInfo::Kind(InfoKind::Wireguard))),
            _ => false,
        });
        Some(LinkInfo {
            index: link.header.index,
            name,
            up: link.header.flags.contains(LinkFlags::Up),
            is_wireguard,
        })
    }

    async fn rule_messages(&self, v6: bool) -> Result<Vec<RuleMessage>, Error> {
        let version = if v6 { IpVersion::V6 } else { IpVersion::V4 };
        let rules: Vec<_> = self.handle.rule().get(version).execute().try_collect().await?;
        Ok(rules)
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).replace().execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn route_list(&self, v6: bool, table_id: u32) -> Result<Vec<RouteSpec>, Error> {
        let filter = if v6 {
            RouteMessageBuilder::<Ipv6Addr>::new().table_id(table_id).build()
        } else {
            RouteMessageBuilder::<Ipv4Addr>::new().table_id(table_id).build()
        };
        let routes: Vec<_> = self.handle.route().get(filter).execute().try_collect().await?;

        // dumps ignore the table unless strict checking is on
        Ok(routes
            .iter()
            .filter_map(Self::route_message_to_spec)
            .filter(|r| r.table_id == table_id)
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        macro_rules! finish {
            ($req:expr) => {{
                let mut req = $req.fw_mark(rule.fw_mark).table_id(rule.table_id).action(RuleAction::ToTable);
                if let Some(prio) = rule.priority {
                    req = req.priority(prio);
                }
                if rule.invert {
                    req.message_mut().header.flags.insert(RuleFlags::Invert);
                }
                req.execute().await?;
            }};
        }

        match (rule.v6, rule.destination.map(|d| (d.address(), d.prefix_length()))) {
            (false, Some((IpAddr::V4(dst), len))) => finish!(self.handle.rule().add().v4().destination_prefix(dst, len)),
            (true, Some((IpAddr::V6(dst), len))) => finish!(self.handle.rule().add().v6().destination_prefix(dst, len)),
            (false, None) => finish!(self.handle.rule().add().v4()),
            (true, None) => finish!(self.handle.rule().add().v6()),
            (_, Some(_)) => {
                return Err(Error::General(format!(
                    "rule destination family does not match rule family: {rule:?}"
                )));
            }
        }
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        for msg in self.rule_messages(rule.v6).await? {
            let matches = Self::rule_message_to_spec(rule.v6, &msg)
                .map(|spec| spec.same_key(rule))
                .unwrap_or(false);
            if matches {
                self.handle.rule().del(msg).execute().await?;
                return Ok(());
            }
        }

        Err(Error::NotFound(format!(
            "rule fw_mark={:#x} table={:#x}",
            rule.fw_mark, rule.table_id
        )))
    }

    async fn rule_list(&self, v6: bool) -> Result<Vec<RuleSpec>, Error> {
        Ok(self
            .rule_messages(v6)
            .await?
            .iter()
            .filter_map(|msg| Self::rule_message_to_spec(v6, msg))
            .collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;
        Ok(links.iter().filter_map(Self::link_message_to_info).collect())
    }

    async fn link_del(&self, index: u32) -> Result<(), Error> {
        self.handle.link().del(index).execute().await?;
        Ok(())
    }

    async fn addr_add(&self, index: u32, address: &IpAddress) -> Result<(), Error> {
        self.handle
            .address()
            .add(index, address.address(), address.prefix_length())
            .execute()
            .await?;
        Ok(())
    }
}

/// Main table routes only; convenience for scans.
pub async fn main_routes<N: NetlinkOps>(netlink: &N, v6: bool) -> Result<Vec<RouteSpec>, Error> {
    netlink.route_list(v6, MAIN_TABLE).await
}
