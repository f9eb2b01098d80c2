use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process;

use mozilla_vpn_lib::command::{Command, Response};
use mozilla_vpn_lib::settings::{FileSettings, MemorySettings, Settings};
use mozilla_vpn_lib::{config, log_output, logging, socket};

mod cli;
mod core;
mod routing;
mod session;
mod split_tunnel;
mod wireguard;

use crate::core::{ClientId, Core, Event};
use crate::core::controller::Controller;
use crate::routing::dns_ops::RealDnsOps;
use crate::routing::firewall::Firewall;
use crate::routing::iptables_ops::RealIptablesOps;
use crate::routing::netlink_ops::RealNetlinkOps;
use crate::routing::route_monitor::RouteMonitor;
use crate::routing::route_watch;
use crate::routing::wg_ops::{RealWgOps, WgOps};
use crate::wireguard::endpoint::SystemResolver;
use crate::wireguard::linux::{LinuxWireguardUtils, TunnelSettings};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("mozillavpn-daemon drives netlink and iptables and only builds for Linux");
    }
}

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn ctrlc_channel() -> Result<mpsc::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        tracing::error!(error = ?e, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigint: receiver closed");
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(()).await.is_err() {
                        tracing::warn!("sigterm: receiver closed");
                        break;
                    }
                },
                else => {
                    tracing::warn!("sigint and sigterm streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn socket_listener(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for running instance");
            match socket::root::process_cmd(socket_path, &Command::Status).await {
                Ok(_) => {
                    tracing::error!("daemon is already running - cannot start another instance");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => {
                    tracing::debug!(warn = ?e, "done probing for running instance");
                }
            };
            fs::remove_file(socket_path).await.map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    let socket_dir = socket_path.parent().ok_or_else(|| {
        tracing::error!("socket path has no parent");
        exitcode::UNAVAILABLE
    })?;
    fs::create_dir_all(socket_dir).await.map_err(|e| {
        tracing::error!(error = %e, "error creating socket directory");
        exitcode::IOERR
    })?;

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding socket");
        exitcode::IOERR
    })?;

    // update permissions to allow unprivileged access
    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "error setting socket permissions");
            exitcode::NOPERM
        })?;

    Ok(listener)
}

/// Accepts clients until cancelled and hands each one its own task.
async fn accept_clients(listener: UnixListener, event_sender: mpsc::Sender<Event>, cancel: CancellationToken) {
    let mut next_client: ClientId = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    next_client += 1;
                    let event_sender = event_sender.clone();
                    let client = next_client;
                    tokio::spawn(async move { serve_client(client, stream, event_sender).await });
                }
                Err(error) => {
                    tracing::error!(%error, "error accepting connection");
                }
            },
        }
    }
}

async fn serve_client(client: ClientId, stream: UnixStream, event_sender: mpsc::Sender<Event>) {
    let uid = match stream.peer_cred() {
        Ok(cred) => Some(cred.uid()),
        Err(error) => {
            tracing::warn!(client, %error, "unable to read peer credentials");
            None
        }
    };
    tracing::debug!(client, ?uid, "client connected");

    let (reader, writer) = stream.into_split();
    let (resp_sender, mut resp_receiver) = mpsc::channel::<Response>(32);
    if event_sender
        .send(Event::ClientConnected {
            client,
            sender: resp_sender,
        })
        .await
        .is_err()
    {
        return;
    }

    // ends once the control loop drops the client's sender
    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(resp) = resp_receiver.recv().await {
            if send_to_socket(&resp, &mut writer).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let cmd = match line.parse::<Command>() {
                    Ok(cmd) => cmd,
                    Err(error) => {
                        tracing::warn!(client, %error, "ignoring unparsable command");
                        continue;
                    }
                };
                tracing::debug!(client, command = %cmd, "incoming command");
                if event_sender.send(Event::Command { client, uid, cmd }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(client, %error, "error reading from client");
                break;
            }
        }
    }
    let _ = event_sender.send(Event::ClientDisconnected { client }).await;
}

async fn send_to_socket<W: AsyncWrite + Unpin>(
    msg: &Response,
    writer: &mut BufWriter<W>,
) -> Result<(), exitcode::ExitCode> {
    let serialized = serde_json::to_string(msg).map_err(|err| {
        tracing::error!(error = ?err, "failed to serialize response");
        exitcode::DATAERR
    })?;
    writer.write_all(serialized.as_bytes()).await.map_err(|err| {
        tracing::error!(error = ?err, "error writing to daemon socket");
        exitcode::IOERR
    })?;
    writer.write_all(b"\n").await.map_err(|err| {
        tracing::error!(error = ?err, "error appending newline to daemon socket");
        exitcode::IOERR
    })?;
    writer.flush().await.map_err(|err| {
        tracing::error!(error = ?err, "error flushing daemon socket");
        exitcode::IOERR
    })?;
    Ok(())
}

fn open_settings() -> Box<dyn Settings> {
    match FileSettings::open_default() {
        Ok(settings) => Box::new(settings),
        Err(error) => {
            tracing::warn!(%error, "unable to open settings - state will not survive a restart");
            Box::new(MemorySettings::default())
        }
    }
}

async fn daemon(args: cli::Cli, log_file: Option<logging::LogFile>) -> Result<(), exitcode::ExitCode> {
    // set up signal handler
    let mut ctrlc_receiver = ctrlc_channel().await?;

    let config = config::read(&args.config_path).await.map_err(|err| {
        tracing::error!(error = %err, "error reading configuration");
        exitcode::CONFIG
    })?;
    tracing::debug!(
        interface = %config.interface,
        fwmark = format!("{:#x}", config.fwmark),
        table = config.table,
        handshake_timeout = %humantime::format_duration(config.handshake_timeout),
        "configuration loaded"
    );

    // check wireguard tooling
    if !RealWgOps.available().await {
        log_output::print_missing_wireguard_tools();
        return Err(exitcode::UNAVAILABLE);
    }

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|err| {
        tracing::error!(error = ?err, "error opening netlink connection");
        exitcode::OSERR
    })?;
    tokio::spawn(conn);
    let netlink = RealNetlinkOps::new(handle);

    let v4 = RealIptablesOps::new(false).map_err(|err| {
        tracing::error!(error = %err, "error opening iptables");
        exitcode::OSERR
    })?;
    let v6 = match RealIptablesOps::new(true) {
        Ok(v6) => Some(v6),
        Err(err) => {
            tracing::warn!(error = %err, "ip6tables unavailable - IPv6 traffic is not marked");
            None
        }
    };
    let firewall = Firewall::new(v4, v6).shared();

    let wg = LinuxWireguardUtils::new(netlink.clone(), RealWgOps, firewall.clone(), TunnelSettings::from(&config));
    let routes = RouteMonitor::new(netlink, config.table);
    let split = split_tunnel::create(&config, firewall).await;
    let controller = Controller::new(&config, wg, RealDnsOps, routes, split, open_settings());

    let cancel = CancellationToken::new();
    let filter = route_watch::Filter::new(&config.interface, config.table);
    let (route_sender, mut route_receiver) = mpsc::channel(1);
    let watch_task = route_watch::spawn(filter.clone(), route_sender, cancel.clone()).map_err(|err| {
        tracing::error!(error = %err, "error subscribing to route changes");
        exitcode::OSERR
    })?;

    // set up system socket
    let socket_path = args.socket_path.clone();
    let listener = socket_listener(&socket_path).await?;
    let (event_sender, mut event_receiver) = mpsc::channel(32);
    let acceptor = tokio::spawn(accept_clients(listener, event_sender.clone(), cancel.clone()));

    log_output::print_daemon_started(&socket_path.display().to_string(), &config.interface);

    let core = Core::new(controller, SystemResolver, log_file, filter);
    let core_loop = core.start(&mut event_receiver, &mut route_receiver);
    let res = loop_daemon(core_loop, &mut ctrlc_receiver, &event_sender).await;

    cancel.cancel();
    let _ = acceptor.await;
    let _ = watch_task.await;
    let _ = fs::remove_file(&socket_path).await.map_err(|err| {
        tracing::error!(error = ?err, "failed removing socket");
    });
    res
}

async fn loop_daemon(
    core_loop: impl Future<Output = ()>,
    ctrlc_receiver: &mut mpsc::Receiver<()>,
    event_sender: &mpsc::Sender<Event>,
) -> Result<(), exitcode::ExitCode> {
    tokio::pin!(core_loop);
    let mut shutdown_ongoing = false;

    loop {
        tokio::select! {
            _ = &mut core_loop => {
                tracing::info!("control loop finished");
                return Ok(());
            }
            Some(_) = ctrlc_receiver.recv() => {
                if shutdown_ongoing {
                    tracing::info!("force shutdown immediately");
                    return Err(exitcode::OK);
                }
                shutdown_ongoing = true;
                tracing::info!("initiate shutdown");
                if event_sender.send(Event::Shutdown).await.is_err() {
                    tracing::warn!("control loop already gone");
                    return Ok(());
                }
            }
        }
    }
}

/// limit the daemon to two threads
/// one for the socket to be responsive
/// one for the control loop and its runners
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let args = cli::parse();

    let log_file = if args.stdout {
        logging::setup_stdout();
        None
    } else {
        match logging::setup_log_file(args.log_file.clone()) {
            Ok(log_file) => Some(log_file),
            Err(e) => {
                logging::setup_stdout();
                tracing::warn!(error = %e, "unable to log to file - logging to stdout");
                None
            }
        }
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match daemon(args, log_file).await {
        Ok(_) => (),
        Err(exitcode::OK) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
