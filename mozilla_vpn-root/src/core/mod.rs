//! The daemon control loop.
//!
//! [`Core`] is the one place that owns tunnel state. Socket connections,
//! route change notifications and runner results all arrive as queued
//! messages and are handled one at a time.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::time::Instant;

use mozilla_vpn_lib::command::{Command, Response};
use mozilla_vpn_lib::interface_config::{DeviceConfig, InterfaceConfig};
use mozilla_vpn_lib::logging::LogFile;

use crate::routing::dns_ops::DnsOps;
use crate::routing::netlink_ops::NetlinkOps;
use crate::routing::route_watch::{self, RouteChanged};
use crate::session::{DaemonSession, Decision};
use crate::wireguard::WireguardUtils;
use crate::wireguard::endpoint::EndpointResolver;

pub mod controller;
pub mod runner;

use controller::{Activated, Controller};
use runner::Results;

pub type ClientId = u64;

/// Messages from the socket side.
pub enum Event {
    ClientConnected {
        client: ClientId,
        sender: mpsc::Sender<Response>,
    },
    ClientDisconnected {
        client: ClientId,
    },
    Command {
        client: ClientId,
        /// `None` when the peer credentials could not be read.
        uid: Option<u32>,
        cmd: Command,
    },
    Shutdown,
}

struct PendingActivation {
    generation: u64,
    cancel: CancellationToken,
}

pub struct Core<W, D, N: NetlinkOps, R> {
    controller: Controller<W, D, N>,
    resolver: R,
    session: DaemonSession,
    log_file: Option<LogFile>,
    route_filter: route_watch::Filter,

    clients: HashMap<ClientId, mpsc::Sender<Response>>,

    // cancellation tokens
    pending: HashMap<i32, PendingActivation>,
    cancel_handshake: Option<CancellationToken>,
    cancel_cgroup_sync: Option<CancellationToken>,
    cancel_for_shutdown: CancellationToken,

    generation: u64,
}

impl<W, D, N, R> Core<W, D, N, R>
where
    W: WireguardUtils,
    D: DnsOps,
    N: NetlinkOps,
    R: EndpointResolver,
{
    pub fn new(
        controller: Controller<W, D, N>,
        resolver: R,
        log_file: Option<LogFile>,
        route_filter: route_watch::Filter,
    ) -> Self {
        Core {
            controller,
            resolver,
            session: DaemonSession::default(),
            log_file,
            route_filter,
            clients: HashMap::new(),
            pending: HashMap::new(),
            cancel_handshake: None,
            cancel_cgroup_sync: None,
            cancel_for_shutdown: CancellationToken::new(),
            generation: 0,
        }
    }

    /// Runs until a shutdown event was handled or every sender is gone.
    pub async fn start(
        mut self,
        event_receiver: &mut mpsc::Receiver<Event>,
        route_receiver: &mut mpsc::Receiver<RouteChanged>,
    ) {
        let (results_sender, mut results_receiver) = mpsc::channel(32);
        self.controller.restore_split_tunnel().await;
        tracing::info!(split_tunnel = self.controller.split_tunnel_kind(), "control loop running");
        loop {
            tokio::select! {
                Some(event) = event_receiver.recv() => {
                    if !self.on_event(event, &results_sender).await {
                        break;
                    }
                }
                Some(results) = results_receiver.recv() => {
                    self.on_results(results, &results_sender).await;
                }
                Some(RouteChanged) = route_receiver.recv() => {
                    self.controller.route_changed().await;
                }
                else => {
                    tracing::warn!("event receiver closed");
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    /// Returns false once the loop should stop.
    async fn on_event(&mut self, event: Event, results_sender: &mpsc::Sender<Results>) -> bool {
        match event {
            Event::ClientConnected { client, sender } => {
                tracing::debug!(client, "client connected");
                self.clients.insert(client, sender);
                true
            }
            Event::ClientDisconnected { client } => {
                tracing::debug!(client, "client disconnected");
                self.clients.remove(&client);
                true
            }
            Event::Command { client, uid, cmd } => {
                self.on_command(client, uid, cmd, results_sender).await;
                true
            }
            Event::Shutdown => {
                self.shutdown().await;
                false
            }
        }
    }

    #[tracing::instrument(skip(self, cmd, results_sender), level = "debug", fields(command = cmd.name()))]
    async fn on_command(
        &mut self,
        client: ClientId,
        uid: Option<u32>,
        cmd: Command,
        results_sender: &mpsc::Sender<Results>,
    ) {
        if self.session.authorize(&cmd, uid, self.controller.is_active()) == Decision::Deny {
            tracing::warn!(?uid, command = cmd.name(), "rejecting unauthorized command");
            self.reply(
                client,
                Response::Unauthorized {
                    command: cmd.name().to_string(),
                },
            );
            return;
        }

        match cmd {
            Command::Activate(req) => match InterfaceConfig::try_from(req) {
                Ok(config) => self.spawn_resolve_runner(config, results_sender),
                Err(error) => {
                    tracing::error!(%error, "invalid activation request");
                    self.broadcast(Response::Disconnected);
                }
            },
            Command::Deactivate => {
                self.cancel_connecting();
                let resp = self.controller.deactivate().await;
                self.route_filter.set_tunnel_index(None);
                self.broadcast(resp);
            }
            Command::Status => {
                let status = self.controller.status().await;
                self.reply(client, Response::Status(status));
            }
            Command::Logs => {
                let logs = match &self.log_file {
                    Some(log_file) => log_file.read_flat().unwrap_or_else(|error| {
                        tracing::warn!(%error, "unable to read log file");
                        String::new()
                    }),
                    None => String::new(),
                };
                self.reply(client, Response::Logs { logs });
            }
            Command::CleanLogs => {
                if let Some(log_file) = &self.log_file {
                    if let Err(error) = log_file.truncate() {
                        tracing::warn!(%error, "unable to truncate log file");
                    }
                }
            }
            Command::Initialize(req) => {
                let resp = match DeviceConfig::try_from(req) {
                    Ok(device) => self.controller.initialize(&device).await,
                    Err(error) => {
                        tracing::error!(%error, "invalid initialize request");
                        Response::Initialized {
                            ok: false,
                            already_active: false,
                            uuid: String::new(),
                        }
                    }
                };
                self.route_filter.set_tunnel_index(self.controller.tunnel_index());
                self.reply(client, resp);
            }
            Command::ExcludeCgroup { cgroup } => {
                if let Err(error) = self.controller.exclude_cgroup(&cgroup).await {
                    tracing::error!(%error, cgroup, "unable to exclude cgroup");
                }
                self.update_cgroup_sync(results_sender);
            }
            Command::ResetCgroup { cgroup } => {
                if let Err(error) = self.controller.reset_cgroup(&cgroup).await {
                    tracing::error!(%error, cgroup, "unable to reset cgroup");
                }
                self.update_cgroup_sync(results_sender);
            }
            Command::ResetAllCgroups => {
                if let Err(error) = self.controller.reset_all_cgroups().await {
                    tracing::error!(%error, "unable to reset cgroups");
                }
                self.update_cgroup_sync(results_sender);
            }
        }
    }

    /// Runs the cgroup sync ticker exactly while there is something to sync.
    fn update_cgroup_sync(&mut self, results_sender: &mpsc::Sender<Results>) {
        match (self.controller.split_tunnel_needs_sync(), self.cancel_cgroup_sync.is_some()) {
            (true, false) => {
                let cancel = self.cancel_for_shutdown.child_token();
                self.cancel_cgroup_sync = Some(cancel.clone());
                let results_sender = results_sender.clone();
                tokio::spawn(async move {
                    cancel
                        .run_until_cancelled(async move { runner::cgroup_sync_ticks(results_sender).await })
                        .await
                });
            }
            (false, true) => {
                if let Some(cancel) = self.cancel_cgroup_sync.take() {
                    cancel.cancel();
                }
            }
            _ => {}
        }
    }

    async fn on_results(&mut self, results: Results, results_sender: &mpsc::Sender<Results>) {
        match results {
            Results::EndpointResolved { generation, config, res } => {
                let current = self
                    .pending
                    .get(&config.hop_index)
                    .is_some_and(|p| p.generation == generation);
                if !current {
                    tracing::debug!(generation, "dropping superseded activation");
                    return;
                }
                self.pending.remove(&config.hop_index);

                let endpoint = match res {
                    Ok(endpoint) => endpoint,
                    Err(error) => {
                        tracing::error!(%error, "unable to resolve server endpoint");
                        self.fail_connection(false).await;
                        return;
                    }
                };
                match self.controller.activate(*config, endpoint).await {
                    Ok(Activated::AlreadyConnected(key)) => {
                        self.broadcast(Response::Connected { pubkey: key.to_string() });
                    }
                    Ok(Activated::Pending) => {
                        self.route_filter.set_tunnel_index(self.controller.tunnel_index());
                        self.spawn_handshake_runner(results_sender);
                    }
                    Err(error) => {
                        tracing::error!(%error, "unable to activate tunnel");
                        self.fail_connection(true).await;
                    }
                }
            }
            Results::HandshakeTick => {
                let check = self.controller.check_handshakes(Instant::now()).await;
                for event in check.events {
                    self.broadcast(event);
                }
                if check.done {
                    if let Some(cancel) = self.cancel_handshake.take() {
                        cancel.cancel();
                    }
                }
            }
            Results::CgroupSyncTick => {
                self.controller.sync_split_tunnel().await;
            }
        }
    }

    async fn fail_connection(&mut self, backend: bool) {
        self.cancel_connecting();
        if backend {
            self.broadcast(Response::BackendFailure);
        }
        let resp = self.controller.deactivate().await;
        self.route_filter.set_tunnel_index(None);
        self.broadcast(resp);
    }

    fn spawn_resolve_runner(&mut self, config: InterfaceConfig, results_sender: &mpsc::Sender<Results>) {
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.cancel_for_shutdown.child_token();
        if let Some(previous) = self.pending.insert(
            config.hop_index,
            PendingActivation {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            tracing::debug!(hop = config.hop_index, "superseding pending activation");
            previous.cancel.cancel();
        }

        let resolver = self.resolver.clone();
        let results_sender = results_sender.clone();
        tokio::spawn(async move {
            cancel
                .run_until_cancelled(async move {
                    runner::resolve_endpoint(resolver, generation, config, results_sender).await;
                })
                .await
        });
    }

    fn spawn_handshake_runner(&mut self, results_sender: &mpsc::Sender<Results>) {
        if self.cancel_handshake.is_some() {
            return;
        }
        let cancel = self.cancel_for_shutdown.child_token();
        self.cancel_handshake = Some(cancel.clone());
        let results_sender = results_sender.clone();
        tokio::spawn(async move {
            cancel
                .run_until_cancelled(async move { runner::handshake_ticks(results_sender).await })
                .await
        });
    }

    fn cancel_connecting(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }
        if let Some(cancel) = self.cancel_handshake.take() {
            cancel.cancel();
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("shutting down control loop");
        self.cancel_for_shutdown.cancel();
        self.pending.clear();
        self.cancel_handshake = None;
        self.cancel_cgroup_sync = None;
        self.controller.shutdown().await;
        self.clients.clear();
    }

    fn reply(&mut self, client: ClientId, resp: Response) {
        let Some(sender) = self.clients.get(&client) else {
            tracing::debug!(client, "client gone before reply");
            return;
        };
        if let Err(error) = sender.try_send(resp) {
            tracing::warn!(client, %error, "unable to queue reply");
        }
    }

    /// Events go to every client. A `disconnected` ends the session unless a
    /// tunnel is still up.
    fn broadcast(&mut self, resp: Response) {
        if resp == Response::Disconnected && !self.controller.is_active() {
            self.session.reset();
        }
        tracing::debug!(event = %resp, clients = self.clients.len(), "broadcasting");
        self.clients.retain(|client, sender| match sender.try_send(resp.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client, "client queue full, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
