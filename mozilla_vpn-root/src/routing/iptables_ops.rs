//! Abstraction over iptables operations for testability.
//!
//! Defines [`IptablesOps`] mirroring the `iptables` crate API.
//! Production code uses [`RealIptablesOps`], one instance per address family.
//! Tests use stateful mocks (see `mocks` module).

pub type IptablesResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Abstraction over iptables chain and rule operations.
///
/// All methods are synchronous, matching the underlying `iptables` crate.
pub trait IptablesOps: Send + Sync {
    fn is_ipv6(&self) -> bool;
    fn chain_exists(&self, table: &str, chain: &str) -> IptablesResult<bool>;
    fn new_chain(&self, table: &str, chain: &str) -> IptablesResult<()>;
    fn flush_chain(&self, table: &str, chain: &str) -> IptablesResult<()>;
    fn delete_chain(&self, table: &str, chain: &str) -> IptablesResult<()>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()>;
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> IptablesResult<()>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<bool>;
}

/// Production [`IptablesOps`] backed by the `iptables` crate.
pub struct RealIptablesOps {
    inner: iptables::IPTables,
    ipv6: bool,
}

impl RealIptablesOps {
    /// `ipv6` selects `ip6tables`.
    pub fn new(ipv6: bool) -> IptablesResult<Self> {
        Ok(Self {
            inner: iptables::new(ipv6)?,
            ipv6,
        })
    }
}

impl IptablesOps for RealIptablesOps {
    fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    fn chain_exists(&self, table: &str, chain: &str) -> IptablesResult<bool> {
        self.inner.chain_exists(table, chain)
    }

    fn new_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        self.inner.new_chain(table, chain)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        self.inner.flush_chain(table, chain)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IptablesResult<()> {
        self.inner.delete_chain(table, chain)
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()> {
        self.inner.append(table, chain, rule)
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> IptablesResult<()> {
        self.inner.insert(table, chain, rule, position)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<()> {
        self.inner.delete(table, chain, rule)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> IptablesResult<bool> {
        self.inner.exists(table, chain, rule)
    }
}
