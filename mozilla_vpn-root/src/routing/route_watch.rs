//! Kernel route change notifications.
//!
//! A dedicated rtnetlink socket joins the link and route multicast groups.
//! Notifications never touch routing state here: relevant ones are reduced to
//! a single queued [`RouteChanged`] event for the control loop, which then
//! calls [`super::route_monitor::RouteMonitor::route_changed`].

use futures::StreamExt;
use rtnetlink::constants::{RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_ROUTE, RTMGRP_LINK};
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::Error;
use super::netlink_ops::{LinkInfo, RealNetlinkOps, RouteSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteChanged;

/// Decides which notifications are our own churn.
#[derive(Clone, Debug)]
pub struct Filter {
    ifname: String,
    table: u32,
    /// 0 while the tunnel does not exist.
    tunnel_index: Arc<AtomicU32>,
}

impl Filter {
    pub fn new(ifname: &str, table: u32) -> Self {
        Filter {
            ifname: ifname.to_string(),
            table,
            tunnel_index: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_tunnel_index(&self, index: Option<u32>) {
        self.tunnel_index.store(index.unwrap_or(0), Ordering::Relaxed);
    }

    fn tunnel_index(&self) -> Option<u32> {
        match self.tunnel_index.load(Ordering::Relaxed) {
            0 => None,
            index => Some(index),
        }
    }

    pub fn route_relevant(&self, route: &RouteSpec) -> bool {
        !route.is_marked()
            && route.table_id != self.table
            && (route.if_index.is_none() || route.if_index != self.tunnel_index())
    }

    pub fn link_relevant(&self, link: &LinkInfo) -> bool {
        link.name != self.ifname
    }

    pub fn accepts(&self, msg: &NetlinkMessage<RouteNetlinkMessage>) -> bool {
        let NetlinkPayload::InnerMessage(inner) = &msg.payload else {
            return false;
        };
        match inner {
            RouteNetlinkMessage::NewRoute(route) | RouteNetlinkMessage::DelRoute(route) => {
                RealNetlinkOps::route_message_to_spec(route).is_some_and(|spec| self.route_relevant(&spec))
            }
            RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
                RealNetlinkOps::link_message_to_info(link).is_none_or(|info| self.link_relevant(&info))
            }
            _ => false,
        }
    }
}

/// Queues a change unless one is already pending. False once the control
/// loop is gone.
pub fn notify(events: &mpsc::Sender<RouteChanged>) -> bool {
    match events.try_send(RouteChanged) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Starts listening. The returned task ends on cancellation or when the
/// receiving side of `events` is dropped.
pub fn spawn(
    filter: Filter,
    events: mpsc::Sender<RouteChanged>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, Error> {
    let (mut conn, _handle, mut messages) = rtnetlink::new_connection()?;
    let groups = RTMGRP_LINK | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE;
    conn.socket_mut().socket_mut().bind(&SocketAddr::new(0, groups))?;
    let conn_task = tokio::spawn(conn);

    Ok(tokio::spawn(async move {
        tracing::debug!("listening for route changes");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = messages.next() => match msg {
                    Some((msg, _)) => {
                        if filter.accepts(&msg) && !notify(&events) {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!("route notification stream closed");
                        break;
                    }
                },
            }
        }
        conn_task.abort();
        tracing::debug!("route watch stopped");
    }))
}
