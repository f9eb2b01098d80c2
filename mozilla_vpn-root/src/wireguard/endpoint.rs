//! Peer endpoint resolution.
//!
//! Hostnames go through the system resolver (`getaddrinfo`) so that its error
//! codes can be told apart: `EAI_NONAME`, `EAI_FAIL` and `EAI_NODATA` are
//! final, everything else is retried with exponential backoff.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;

use std::ffi::{CStr, CString};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// glibc value; not exported by every libc flavour.
const EAI_NODATA: i32 = -5;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("unable to resolve {host}: {reason}")]
    Permanent { host: String, reason: String },
    #[error("temporary failure resolving {host}: {reason}")]
    Transient { host: String, reason: String },
    #[error("{0} resolved to no usable address")]
    NoAddress(String),
    #[error("resolver task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

#[async_trait]
pub trait EndpointResolver: Send + Sync + Clone + 'static {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error>;
}

/// Retry policy of the endpoint lookup: 1s growing by 1.2 up to 20s, 15 retries.
pub fn backoff() -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_min_delay(Duration::from_secs(1))
        .with_factor(1.2)
        .with_max_delay(Duration::from_secs(20))
        .with_max_times(15)
}

/// Resolves `host:port`, sleeping between transient failures.
pub async fn resolve_with_backoff<R: EndpointResolver>(
    resolver: &R,
    host: &str,
    port: u16,
    policy: ExponentialBuilder,
) -> Result<SocketAddr, Error> {
    (|| async { resolver.resolve(host, port).await })
        .retry(policy)
        .when(Error::is_transient)
        .notify(|err: &Error, dur: Duration| {
            tracing::warn!(error = %err, "retrying endpoint resolution in {:?}", dur);
        })
        .await
}

#[derive(Clone, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl EndpointResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let owned = host.to_string();
        tokio::task::spawn_blocking(move || getaddrinfo(&owned, port))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}

/// Owns a `getaddrinfo` result list.
struct AddrInfoList(*mut libc::addrinfo);

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: pointer came from a successful getaddrinfo and is freed once
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

fn classify(host: &str, rv: i32) -> Error {
    // SAFETY: gai_strerror returns a pointer to a static string
    let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rv)) }
        .to_string_lossy()
        .into_owned();
    let host = host.to_string();
    if rv == libc::EAI_NONAME || rv == libc::EAI_FAIL || rv == EAI_NODATA {
        Error::Permanent { host, reason }
    } else {
        Error::Transient { host, reason }
    }
}

fn getaddrinfo(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let c_host = CString::new(host).map_err(|_| Error::Permanent {
        host: host.to_string(),
        reason: "embedded NUL".into(),
    })?;
    let c_port = CString::new(port.to_string()).map_err(|_| Error::NoAddress(host.to_string()))?;

    // SAFETY: all-zero is a valid addrinfo hints value
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_DGRAM;
    hints.ai_protocol = libc::IPPROTO_UDP;

    let mut list = AddrInfoList(std::ptr::null_mut());
    // SAFETY: valid C strings and hints, result written into the guard
    let rv = unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut list.0) };
    if rv != 0 {
        return Err(classify(host, rv));
    }

    let mut cur = list.0;
    while !cur.is_null() {
        // SAFETY: nodes of the list stay valid until the guard frees it
        let ai = unsafe { &*cur };
        let len = ai.ai_addrlen as usize;
        if ai.ai_family == libc::AF_INET && len == std::mem::size_of::<libc::sockaddr_in>() {
            // SAFETY: family and length checked above
            let sin = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            return Ok(SocketAddr::new(IpAddr::V4(ip), port));
        }
        if ai.ai_family == libc::AF_INET6 && len == std::mem::size_of::<libc::sockaddr_in6>() {
            // SAFETY: family and length checked above
            let sin6 = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            return Ok(SocketAddr::new(IpAddr::V6(ip), port));
        }
        cur = ai.ai_next;
    }
    Err(Error::NoAddress(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::mocks::MockResolver;

    fn fast() -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_max_times(15)
    }

    #[tokio::test]
    async fn literal_addresses_skip_the_resolver() -> anyhow::Result<()> {
        let addr = SystemResolver.resolve("185.65.135.5", 51820).await?;
        assert_eq!(addr, "185.65.135.5:51820".parse()?);
        let addr = SystemResolver.resolve("2a03:1b20::5", 51820).await?;
        assert_eq!(addr, "[2a03:1b20::5]:51820".parse()?);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> anyhow::Result<()> {
        let resolver = MockResolver::new("185.65.135.5:51820".parse()?);
        resolver.fail_transient(3);

        let addr = resolve_with_backoff(&resolver, "se-got-wg-001.example", 51820, fast()).await?;
        assert_eq!(addr.port(), 51820);
        assert_eq!(resolver.calls(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failures_stop_immediately() -> anyhow::Result<()> {
        let resolver = MockResolver::new("185.65.135.5:51820".parse()?);
        resolver.fail_permanent();

        let res = resolve_with_backoff(&resolver, "nowhere.invalid", 51820, fast()).await;
        assert!(matches!(res, Err(Error::Permanent { .. })));
        assert_eq!(resolver.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retries_are_bounded() -> anyhow::Result<()> {
        let resolver = MockResolver::new("185.65.135.5:51820".parse()?);
        resolver.fail_transient(100);

        let res = resolve_with_backoff(&resolver, "flaky.example", 51820, fast()).await;
        assert!(matches!(res, Err(Error::Transient { .. })));
        assert_eq!(resolver.calls(), 16);
        Ok(())
    }

    #[test]
    fn resolver_codes_are_classified() {
        assert!(!classify("a", libc::EAI_NONAME).is_transient());
        assert!(!classify("a", libc::EAI_FAIL).is_transient());
        assert!(!classify("a", EAI_NODATA).is_transient());
        assert!(classify("a", libc::EAI_AGAIN).is_transient());
    }
}
