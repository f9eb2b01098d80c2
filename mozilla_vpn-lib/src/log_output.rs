use humantime::format_duration;
use serde::ser::Serialize;

use std::fmt::{self, Debug, Display};
use std::time::{Duration, SystemTime};

const KEY_PREFIX_LEN: usize = 12;

pub fn serialize<T>(v: &T) -> String
where
    T: ?Sized + Serialize,
{
    match serde_json::to_string(&v) {
        Ok(s) => s,
        Err(e) => format!("serialization error: {e}"),
    }
}

pub fn elapsed(timestamp: &SystemTime) -> String {
    match timestamp.elapsed() {
        Ok(elapsed) => duration(elapsed),
        Err(e) => format!("error displaying duration: {e}"),
    }
}

/// Human readable duration, cut after the second unit ("1h 2m").
pub fn duration(d: Duration) -> String {
    let formatted = format_duration(Duration::from_secs(d.as_secs())).to_string();
    truncate_after_second_space(&formatted).to_string()
}

/// Abbreviated WireGuard key, enough to tell peers apart in logs.
pub fn key(key: &str) -> String {
    match key.char_indices().nth(KEY_PREFIX_LEN) {
        Some((idx, _)) => format!("{}..", &key[..idx]),
        None => key.to_string(),
    }
}

fn truncate_after_second_space(s: &str) -> &str {
    let spaces = s.match_indices(' ').take(2);
    if let Some((index, _)) = spaces.last() {
        &s[..index]
    } else {
        s
    }
}

/// Wraps values that must not reach production logs, such as peer keys and
/// addresses. Debug builds print the value.
pub struct Sensitive<T>(pub T);

impl<T: Display> Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if cfg!(debug_assertions) {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<redacted>")
        }
    }
}

impl<T: Debug> Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if cfg!(debug_assertions) {
            write!(f, "{:?}", self.0)
        } else {
            write!(f, "<redacted>")
        }
    }
}

pub fn print_daemon_started(socket: &str, interface: &str) {
    tracing::info!(
        r#"

            /---============================---\
            |   MOZILLA VPN DAEMON LISTENING   |
            \---============================---/

            socket: {}
            interface: {}
        "#,
        socket,
        interface
    );
}

pub fn print_missing_wireguard_tools() {
    tracing::error!(
        r#"

>>!!>> Unable to find the WireGuard userspace tools.
>>!!>> The daemon configures the tunnel with `wg` and `ip`.
>>!!>> Please install the `wireguard-tools` and `iproute2` packages.
"#
    );
}
