use exitcode::{self, ExitCode};

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process;
use std::time::{Duration, SystemTime};

use mozilla_vpn_lib::command::{Command, Response, StatusResponse};
use mozilla_vpn_lib::socket;

mod cli;

use cli::Payload;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();
    let json = args.json;
    let wait = matches!(args.command, cli::Command::Activate { no_wait: false, .. });
    let watch = matches!(args.command, cli::Command::Watch);

    let payload = match args.command.payload_file() {
        Some(file) => match read_payload(&args.command, file) {
            Ok(payload) => Some(payload),
            Err(e) => {
                eprintln!("Error reading {}: {}", file.display(), e);
                process::exit(exitcode::DATAERR);
            }
        },
        None => None,
    };

    let read_timeout = if watch { Duration::MAX } else { args.timeout };
    let mut client = match socket::Client::connect(&args.socket_path, read_timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error connecting to daemon: {}", e);
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if watch {
        process::exit(watch_events(&mut client, json));
    }

    let Some(cmd) = args.command.into_lib(payload) else {
        eprintln!("Nothing to send");
        process::exit(exitcode::USAGE);
    };
    let exit = match client.request(&cmd) {
        Ok(Some(resp)) => pretty_print(&resp, json),
        Ok(None) if wait => wait_for_handshake(&mut client, json),
        Ok(None) => exitcode::OK,
        Err(e) => {
            eprintln!("Error processing {}: {}", cmd, e);
            exitcode::IOERR
        }
    };
    process::exit(exit);
}

fn read_payload(cmd: &cli::Command, file: &Path) -> Result<Payload, String> {
    let content = if file == Path::new("-") {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content).map_err(|e| e.to_string())?;
        content
    } else {
        fs::read_to_string(file).map_err(|e| e.to_string())?
    };
    parse_payload(cmd, &content)
}

fn parse_payload(cmd: &cli::Command, content: &str) -> Result<Payload, String> {
    match cmd {
        cli::Command::Initialize { .. } => serde_json::from_str(content)
            .map(Payload::Initialize)
            .map_err(|e| e.to_string()),
        cli::Command::Activate { .. } => serde_json::from_str(content)
            .map(Payload::Activate)
            .map_err(|e| e.to_string()),
        _ => Err("command takes no payload".to_string()),
    }
}

/// Blocks until the activation settles into an event.
fn wait_for_handshake(client: &mut socket::Client, json: bool) -> ExitCode {
    loop {
        match client.recv() {
            Ok(resp) if resp.is_event() => return pretty_print(&resp, json),
            Ok(_) => continue,
            Err(e) => {
                eprintln!("No handshake result: {}", e);
                return exitcode::TEMPFAIL;
            }
        }
    }
}

fn watch_events(client: &mut socket::Client, json: bool) -> ExitCode {
    loop {
        match client.recv() {
            Ok(resp) => {
                pretty_print(&resp, json);
            }
            Err(socket::Error::Closed) => return exitcode::OK,
            Err(e) => {
                eprintln!("Error reading events: {}", e);
                return exitcode::IOERR;
            }
        }
    }
}

fn pretty_print(resp: &Response, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(resp) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("Error serializing response: {}", e);
                return exitcode::SOFTWARE;
            }
        }
        return exit_code(resp);
    }

    // pretty print for users
    match resp {
        Response::Status(status) => println!("{}", format_status(status)),
        Response::Logs { logs } => println!("{}", logs.replace('|', "\n")),
        Response::Connected { pubkey } => println!("Connected to {}", pubkey),
        Response::Disconnected => println!("Disconnected"),
        Response::BackendFailure => eprintln!("The daemon failed to configure the tunnel, see `logs`"),
        Response::Initialized {
            ok: true,
            already_active,
            uuid,
        } => {
            if *already_active {
                println!("Tunnel interface already up (connection {})", uuid);
            } else {
                println!("Tunnel interface ready (connection {})", uuid);
            }
        }
        Response::Initialized { ok: false, .. } => eprintln!("Unable to create the tunnel interface"),
        Response::HandshakeFailed { pubkey } => eprintln!("No handshake with {}", pubkey),
        Response::Unauthorized { command } => {
            eprintln!("Not allowed to {}: the daemon is in use by another user", command)
        }
    }
    exit_code(resp)
}

fn exit_code(resp: &Response) -> ExitCode {
    match resp {
        Response::BackendFailure => exitcode::OSERR,
        Response::Initialized { ok: false, .. } => exitcode::UNAVAILABLE,
        Response::HandshakeFailed { .. } => exitcode::TEMPFAIL,
        Response::Unauthorized { .. } => exitcode::NOPERM,
        _ => exitcode::OK,
    }
}

fn format_status(status: &StatusResponse) -> String {
    if !status.connected {
        return "Status: disconnected".to_string();
    }
    let mut str_resp = "Status: connected\n".to_string();
    if let Some(gateway) = &status.server_ipv4_gateway {
        str_resp.push_str(&format!("Server gateway: {}\n", gateway));
    }
    if let Some(address) = &status.device_ipv4_address {
        str_resp.push_str(&format!("Device address: {}\n", address));
    }
    if let Some(ms) = status.date {
        let since = SystemTime::UNIX_EPOCH + Duration::from_millis(ms);
        str_resp.push_str(&format!("Connected since: {}\n", humantime::format_rfc3339_seconds(since)));
    }
    str_resp.push_str(&format!("Sent: {} bytes, received: {} bytes", status.tx_bytes, status.rx_bytes));
    str_resp
}
