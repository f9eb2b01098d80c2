//! Tasks spawned by the control loop. They never touch tunnel state and
//! deliver their outcome through the results channel.

use tokio::sync::mpsc;
use tokio::time;

use std::net::SocketAddr;
use std::time::Duration;

use mozilla_vpn_lib::interface_config::InterfaceConfig;

use crate::wireguard::endpoint::{self, EndpointResolver};

/// How often peers are checked for a first handshake.
pub const HANDSHAKE_POLL: Duration = Duration::from_millis(250);
/// How often excluded cgroups are re-read for new processes.
pub const CGROUP_SYNC: Duration = Duration::from_secs(1);

/// Results indicate events that arise from concurrent runners.
pub enum Results {
    EndpointResolved {
        generation: u64,
        config: Box<InterfaceConfig>,
        res: Result<SocketAddr, endpoint::Error>,
    },
    HandshakeTick,
    CgroupSyncTick,
}

pub async fn resolve_endpoint<R: EndpointResolver>(
    resolver: R,
    generation: u64,
    config: InterfaceConfig,
    results_sender: mpsc::Sender<Results>,
) {
    let res = match config.endpoint_host() {
        Some(host) => endpoint::resolve_with_backoff(&resolver, host, config.server_port, endpoint::backoff()).await,
        None => Err(endpoint::Error::NoAddress("peer".to_string())),
    };
    let _ = results_sender
        .send(Results::EndpointResolved {
            generation,
            config: Box::new(config),
            res,
        })
        .await;
}

pub async fn handshake_ticks(results_sender: mpsc::Sender<Results>) {
    ticks(HANDSHAKE_POLL, results_sender, || Results::HandshakeTick).await
}

pub async fn cgroup_sync_ticks(results_sender: mpsc::Sender<Results>) {
    ticks(CGROUP_SYNC, results_sender, || Results::CgroupSyncTick).await
}

async fn ticks(period: Duration, results_sender: mpsc::Sender<Results>, tick: fn() -> Results) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if results_sender.send(tick()).await.is_err() {
            break;
        }
    }
}
