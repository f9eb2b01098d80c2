//! Exclusion routes and default-route capture.
//!
//! All traffic without the bypass mark is looked up in the tunnel table
//! (policy rule installed by the WireGuard backend). The monitor keeps two
//! kinds of marked routes in that table:
//!
//! - **exclusions**: destinations that must leave through the physical
//!   network. When the best main-table route for the destination is a
//!   shorter covering prefix, its next hop is copied explicitly; otherwise a
//!   `throw` route hands the lookup back to the main table.
//! - **clones** (default-route capture): copies of the non-default main table
//!   routes, so that directly reachable networks stay reachable while the
//!   tunnel owns the default route. Clones are refreshed on every scan and
//!   pruned once a scan no longer observes them.
//!
//! The monitor is only ever driven from the control loop; kernel change
//! notifications arrive there through [`super::route_watch`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use mozilla_vpn_lib::ip_address::IpAddress;
use mozilla_vpn_lib::log_output::Sensitive;

use super::netlink_ops::{NetlinkOps, RouteKind, RouteSpec, main_routes};
use super::{Error, ignore_not_found};

/// Where an exclusion leaves the machine.
#[derive(Clone, Debug, PartialEq)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub if_index: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExclusionRoute {
    pub prefix: IpAddress,
    /// `None` when the main table already routes the prefix itself.
    pub next_hop: Option<NextHop>,
    installed: RouteSpec,
}

#[derive(Clone, Debug, PartialEq)]
struct ClonedRoute {
    installed: RouteSpec,
    /// Last scan that observed the original.
    age: u64,
}

struct Candidate {
    prefix_len: u8,
    metric: u32,
    hop: NextHop,
}

pub struct RouteMonitor<N: NetlinkOps> {
    netlink: N,
    table: u32,
    tunnel_index: Option<u32>,
    exclusions: BTreeMap<IpAddress, ExclusionRoute>,
    clones: BTreeMap<IpAddress, ClonedRoute>,
    pass: u64,
    capture: bool,
    /// Links that may carry an exclusion: up and not the tunnel.
    usable_links: HashSet<u32>,
}

impl<N: NetlinkOps> RouteMonitor<N> {
    pub fn new(netlink: N, table: u32) -> Self {
        RouteMonitor {
            netlink,
            table,
            tunnel_index: None,
            exclusions: BTreeMap::new(),
            clones: BTreeMap::new(),
            pass: 0,
            capture: false,
            usable_links: HashSet::new(),
        }
    }

    /// Routes through this interface are never candidates nor captured.
    pub fn set_tunnel_index(&mut self, index: Option<u32>) {
        self.tunnel_index = index;
    }

    pub fn exclusion(&self, prefix: &IpAddress) -> Option<&ExclusionRoute> {
        self.exclusions.get(prefix)
    }

    pub fn exclusion_count(&self) -> usize {
        self.exclusions.len()
    }

    pub fn captured(&self) -> impl Iterator<Item = &IpAddress> {
        self.clones.keys()
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture
    }

    // ========================================================================
    // Exclusions
    // ========================================================================

    pub async fn add_exclusion_route(&mut self, prefix: IpAddress) -> Result<(), Error> {
        if self.exclusions.contains_key(&prefix) {
            return Err(Error::AlreadyExists(prefix));
        }
        if self.usable_links.is_empty() {
            self.refresh_links().await?;
        }

        let next_hop = self.best_next_hop(&prefix).await?;
        let installed = self.exclusion_spec(&prefix, next_hop.as_ref());
        self.netlink.route_replace(&installed).await?;
        // a clone with the same destination was just overwritten
        self.clones.remove(&prefix);

        tracing::info!(prefix = %Sensitive(prefix), ?next_hop, "exclusion route added");
        self.exclusions.insert(
            prefix,
            ExclusionRoute {
                prefix,
                next_hop,
                installed,
            },
        );
        Ok(())
    }

    pub async fn delete_exclusion_route(&mut self, prefix: &IpAddress) -> Result<(), Error> {
        let Some(entry) = self.exclusions.get(prefix) else {
            return Ok(());
        };
        if let Err(e) = ignore_not_found(self.netlink.route_del(&entry.installed).await) {
            tracing::warn!(prefix = %Sensitive(prefix), error = %e, "failed to delete exclusion route");
            return Err(e);
        }
        self.exclusions.remove(prefix);
        tracing::info!(prefix = %Sensitive(prefix), "exclusion route deleted");

        if self.capture {
            if let Err(e) = self.update_captured_routes(prefix.is_ipv6()).await {
                tracing::warn!(error = %e, "failed to refresh captured routes");
            }
        }
        Ok(())
    }

    pub async fn flush_exclusion_routes(&mut self) {
        let entries = std::mem::take(&mut self.exclusions);
        for (prefix, entry) in entries {
            if let Err(e) = ignore_not_found(self.netlink.route_del(&entry.installed).await) {
                tracing::warn!(prefix = %Sensitive(prefix), error = %e, "failed to flush exclusion route, continuing anyway");
            }
        }
    }

    /// Longest covering main table route, lowest route metric on ties.
    /// Linux links carry no metric of their own, so the route metric is the
    /// whole cost.
    async fn best_next_hop(&self, prefix: &IpAddress) -> Result<Option<NextHop>, Error> {
        let routes = main_routes(&self.netlink, prefix.is_ipv6()).await?;

        let mut best: Option<Candidate> = None;
        for route in &routes {
            if route.kind != RouteKind::Unicast || route.is_marked() {
                continue;
            }
            let Some(oif) = route.if_index else {
                continue;
            };
            if Some(oif) == self.tunnel_index {
                continue;
            }
            if !route.destination.covers(prefix) {
                continue;
            }
            if !self.usable_links.contains(&oif) {
                continue;
            }
            let prefix_len = route.destination.prefix_length();
            let metric = route.metric.unwrap_or(0);
            let better = match &best {
                None => true,
                Some(b) => prefix_len > b.prefix_len || (prefix_len == b.prefix_len && metric < b.metric),
            };
            if better {
                best = Some(Candidate {
                    prefix_len,
                    metric,
                    hop: NextHop {
                        gateway: route.gateway,
                        if_index: oif,
                    },
                });
            }
        }

        Ok(match best {
            Some(b) if b.prefix_len < prefix.prefix_length() => Some(b.hop),
            // exact match: the main table handles it already
            Some(_) => None,
            None => {
                tracing::warn!(prefix = %Sensitive(prefix), "no route covers exclusion");
                None
            }
        })
    }

    fn exclusion_spec(&self, prefix: &IpAddress, next_hop: Option<&NextHop>) -> RouteSpec {
        match next_hop {
            Some(hop) => RouteSpec {
                gateway: hop.gateway,
                if_index: Some(hop.if_index),
                ..RouteSpec::unicast(*prefix, self.table)
            }
            .marked(),
            None => RouteSpec::throw(*prefix, self.table).marked(),
        }
    }

    // ========================================================================
    // Route table changes
    // ========================================================================

    /// Reacts to a change of the kernel routing state.
    pub async fn route_changed(&mut self) -> Result<(), Error> {
        self.refresh_links().await?;

        if self.capture {
            for v6 in [false, true] {
                if let Err(e) = self.update_captured_routes(v6).await {
                    tracing::warn!(error = %e, v6, "failed to update captured routes");
                }
            }
        }

        let prefixes: Vec<IpAddress> = self.exclusions.keys().copied().collect();
        for prefix in prefixes {
            let next_hop = match self.best_next_hop(&prefix).await {
                Ok(hop) => hop,
                Err(e) => {
                    tracing::warn!(prefix = %Sensitive(prefix), error = %e, "failed to evaluate exclusion route");
                    continue;
                }
            };
            let spec = self.exclusion_spec(&prefix, next_hop.as_ref());
            let unchanged = self
                .exclusions
                .get(&prefix)
                .map(|e| e.installed == spec)
                .unwrap_or(true);
            if unchanged {
                continue;
            }
            match self.netlink.route_replace(&spec).await {
                Ok(()) => {
                    tracing::debug!(prefix = %Sensitive(prefix), ?next_hop, "exclusion route moved");
                    if let Some(entry) = self.exclusions.get_mut(&prefix) {
                        entry.next_hop = next_hop;
                        entry.installed = spec;
                    }
                }
                Err(e) => {
                    tracing::warn!(prefix = %Sensitive(prefix), error = %e, "failed to move exclusion route, retrying on next change");
                }
            }
        }
        Ok(())
    }

    async fn refresh_links(&mut self) -> Result<(), Error> {
        let links = self.netlink.link_list().await?;
        self.usable_links = links
            .iter()
            .filter(|l| l.up && Some(l.index) != self.tunnel_index)
            .map(|l| l.index)
            .collect();
        Ok(())
    }

    // ========================================================================
    // Default-route capture
    // ========================================================================

    pub async fn set_default_route_capture(&mut self, enable: bool) -> Result<(), Error> {
        if self.capture == enable {
            return Ok(());
        }
        self.capture = enable;
        if enable {
            self.update_captured_routes(false).await?;
            self.update_captured_routes(true).await
        } else {
            self.flush_captured_routes().await;
            Ok(())
        }
    }

    /// One scan of the main table for one family.
    pub async fn update_captured_routes(&mut self, v6: bool) -> Result<(), Error> {
        self.pass += 1;
        let pass = self.pass;

        let mut routes = main_routes(&self.netlink, v6).await?;
        routes.sort_by_key(|r| r.metric.unwrap_or(0));

        let mut seen = BTreeSet::new();
        for route in routes {
            let dst = route.destination;
            if route.kind != RouteKind::Unicast || route.is_marked() || dst.is_default() || dst.is_special() {
                continue;
            }
            let Some(oif) = route.if_index else {
                continue;
            };
            if Some(oif) == self.tunnel_index || self.exclusions.contains_key(&dst) {
                continue;
            }
            // lowest metric wins for duplicate destinations
            if !seen.insert(dst) {
                continue;
            }

            let spec = RouteSpec {
                gateway: route.gateway,
                if_index: Some(oif),
                ..RouteSpec::unicast(dst, self.table)
            }
            .marked();
            if let Some(clone) = self.clones.get_mut(&dst) {
                clone.age = pass;
                if clone.installed == spec {
                    continue;
                }
            }
            match self.netlink.route_replace(&spec).await {
                Ok(()) => {
                    tracing::debug!(prefix = %Sensitive(dst), "captured route");
                    self.clones.insert(dst, ClonedRoute { installed: spec, age: pass });
                }
                Err(e) => tracing::warn!(prefix = %Sensitive(dst), error = %e, "failed to capture route"),
            }
        }

        let stale: Vec<IpAddress> = self
            .clones
            .iter()
            .filter(|(dst, clone)| dst.is_ipv6() == v6 && clone.age < pass)
            .map(|(dst, _)| *dst)
            .collect();
        for dst in stale {
            let Some(clone) = self.clones.get(&dst) else {
                continue;
            };
            match ignore_not_found(self.netlink.route_del(&clone.installed).await) {
                Ok(()) => {
                    tracing::debug!(prefix = %Sensitive(dst), "dropped captured route");
                    self.clones.remove(&dst);
                }
                Err(e) => tracing::warn!(prefix = %Sensitive(dst), error = %e, "failed to drop captured route"),
            }
        }
        Ok(())
    }

    pub async fn flush_captured_routes(&mut self) {
        let clones = std::mem::take(&mut self.clones);
        for (dst, clone) in clones {
            if let Err(e) = ignore_not_found(self.netlink.route_del(&clone.installed).await) {
                tracing::warn!(prefix = %Sensitive(dst), error = %e, "failed to flush captured route, continuing anyway");
            }
        }
    }

    /// Removes every route this monitor installed.
    pub async fn shutdown(&mut self) {
        self.flush_exclusion_routes().await;
        self.flush_captured_routes().await;
    }
}

impl<N: NetlinkOps> Drop for RouteMonitor<N> {
    fn drop(&mut self) {
        if !self.exclusions.is_empty() || !self.clones.is_empty() {
            tracing::warn!(
                exclusions = self.exclusions.len(),
                captured = self.clones.len(),
                "route monitor dropped with routes still installed"
            );
        }
    }
}
