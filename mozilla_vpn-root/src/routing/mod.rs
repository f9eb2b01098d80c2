//! Kernel facing building blocks: netlink, `wg` tooling, iptables and the
//! resolver, each behind a trait so the layers above can be tested against
//! stateful mocks.

use thiserror::Error;

use mozilla_vpn_lib::ip_address::IpAddress;
use mozilla_vpn_lib::shell_command_ext;

pub mod dns_ops;
pub mod firewall;
pub mod iptables_ops;
pub mod netlink_ops;
pub mod route_monitor;
pub mod route_watch;
pub mod wg_ops;

#[cfg(test)]
pub mod mocks;

/// The kernel's `main` routing table.
pub const MAIN_TABLE: u32 = 254;

/// `RTPROT_BOOT`, used for the allowed-IP routes of the tunnel table.
pub const PROTOCOL_BOOT: u8 = 3;

/// Protocol and metric tagging every route the route monitor installs, so
/// table scans and change notifications can recognise its own work.
pub const MARKER_PROTOCOL: u8 = 0x6d;
pub const MARKER_METRIC: u32 = 0x5e72;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already present in kernel: {0}")]
    Exists(String),
    #[error("exclusion route for {0} already exists")]
    AlreadyExists(IpAddress),
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("iptables error: {0}")]
    IpTables(String),
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Deleting something that is already gone counts as done.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::ShellCommand(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(target_os = "linux")]
impl From<rtnetlink::Error> for Error {
    fn from(error: rtnetlink::Error) -> Self {
        match error {
            rtnetlink::Error::NetlinkError(ref msg) => {
                let errno = msg.code.map_or(0, |c| -c.get());
                match errno {
                    libc::ENOENT | libc::ESRCH | libc::ENODEV => Error::NotFound(error.to_string()),
                    libc::EEXIST => Error::Exists(error.to_string()),
                    _ => Error::Netlink(error.to_string()),
                }
            }
            other => Error::Netlink(other.to_string()),
        }
    }
}

/// Runs a cleanup step, logging instead of failing.
pub async fn teardown_op<F, Fut, E>(op_name: &str, op: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(error) = op().await {
        tracing::warn!(%error, "failed to {}, continuing anyway", op_name);
    } else {
        tracing::debug!("{}", op_name);
    }
}

/// Maps "not found" to success.
pub fn ignore_not_found(res: Result<(), Error>) -> Result<(), Error> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_normalized() {
        assert!(ignore_not_found(Err(Error::NotFound("route".into()))).is_ok());
        assert!(ignore_not_found(Err(Error::Netlink("EPERM".into()))).is_err());

        let shell = shell_command_ext::Error::CommandFailed {
            status: Some(1),
            stderr: "Cannot find device \"moz0\"".into(),
        };
        assert!(Error::from(shell).is_not_found());
    }
}
