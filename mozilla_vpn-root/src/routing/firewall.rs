//! iptables side of the tunnel.
//!
//! Three private chains are hooked into the built-in ones while the tunnel is
//! up:
//!
//! | table  | chain               | jumped from   | purpose                                   |
//! |--------|---------------------|---------------|-------------------------------------------|
//! | mangle | `MOZVPN_OUTPUT`     | `OUTPUT`      | restore/save the bypass mark, cgroup marks |
//! | mangle | `MOZVPN_PREROUTING` | `PREROUTING`  | mark packets arriving from the server      |
//! | nat    | `MOZVPN_NAT`        | `POSTROUTING` | masquerade bypassing cgroup traffic        |
//!
//! Cgroup classification is remembered while the tunnel is down and applied
//! on the next [`Firewall::up`].

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use super::Error;
use super::iptables_ops::{IptablesOps, IptablesResult};

const TABLE_MANGLE: &str = "mangle";
const TABLE_NAT: &str = "nat";
const CHAIN_OUTPUT: &str = "MOZVPN_OUTPUT";
const CHAIN_PREROUTING: &str = "MOZVPN_PREROUTING";
const CHAIN_NAT: &str = "MOZVPN_NAT";

const HOOKS: [(&str, &str, &str); 3] = [
    (TABLE_MANGLE, "OUTPUT", CHAIN_OUTPUT),
    (TABLE_MANGLE, "PREROUTING", CHAIN_PREROUTING),
    (TABLE_NAT, "POSTROUTING", CHAIN_NAT),
];

pub type SharedFirewall<I> = Arc<tokio::sync::Mutex<Firewall<I>>>;

#[derive(Clone, Debug, PartialEq)]
struct Active {
    ifname: String,
    fwmark: u32,
}

#[derive(Clone, Debug, PartialEq)]
enum CgroupMatch {
    ClassId(u32),
    Path(String),
}

impl CgroupMatch {
    fn matcher(&self) -> String {
        match self {
            CgroupMatch::ClassId(classid) => format!("-m cgroup --cgroup {classid:#010x}"),
            CgroupMatch::Path(path) => format!("-m cgroup --path {path}"),
        }
    }
}

pub struct Firewall<I: IptablesOps> {
    v4: I,
    v6: Option<I>,
    active: Option<Active>,
    cgroup_v1: Option<u32>,
    cgroup_v2: BTreeSet<String>,
    inbound: BTreeSet<IpAddr>,
}

fn ipt_err(e: Box<dyn std::error::Error>) -> Error {
    Error::IpTables(e.to_string())
}

impl<I: IptablesOps> Firewall<I> {
    pub fn new(v4: I, v6: Option<I>) -> Self {
        Firewall {
            v4,
            v6,
            active: None,
            cgroup_v1: None,
            cgroup_v2: BTreeSet::new(),
            inbound: BTreeSet::new(),
        }
    }

    pub fn shared(self) -> SharedFirewall<I> {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn is_up(&self) -> bool {
        self.active.is_some()
    }

    fn families(&self) -> impl Iterator<Item = &I> {
        std::iter::once(&self.v4).chain(self.v6.iter())
    }

    fn family_of(&self, ip: &IpAddr) -> Option<&I> {
        match ip {
            IpAddr::V4(_) => Some(&self.v4),
            IpAddr::V6(_) => self.v6.as_ref(),
        }
    }

    /// Creates the chains, hooks them and installs the static rules.
    pub fn up(&mut self, ifname: &str, fwmark: u32) -> Result<(), Error> {
        if self.active.is_some() {
            self.down();
        }
        let active = Active {
            ifname: ifname.to_string(),
            fwmark,
        };

        let res: Result<(), Error> = self
            .families()
            .try_for_each(|ops| install_chains(ops, &active).map_err(ipt_err));
        if let Err(e) = res {
            tracing::error!(error = %e, "firewall setup failed, rolling back");
            self.down();
            return Err(e);
        }
        self.active = Some(active);

        let mut cgroups: Vec<CgroupMatch> = self.cgroup_v1.iter().map(|c| CgroupMatch::ClassId(*c)).collect();
        cgroups.extend(self.cgroup_v2.iter().cloned().map(CgroupMatch::Path));
        for cgroup in cgroups {
            if let Err(e) = self.apply_cgroup(&cgroup, true) {
                tracing::error!(error = %e, "firewall setup failed, rolling back");
                self.down();
                return Err(e);
            }
        }
        tracing::info!(ifname, fwmark = format!("{fwmark:#x}"), "firewall up");
        Ok(())
    }

    /// Removes everything `up` created. Missing chains are fine.
    pub fn down(&mut self) {
        for ops in self.families() {
            for (table, builtin, chain) in HOOKS {
                let jump = format!("-j {chain}");
                if matches!(ops.exists(table, builtin, &jump), Ok(true)) {
                    if let Err(error) = ops.delete(table, builtin, &jump) {
                        tracing::warn!(%error, table, chain, "failed to unhook chain, continuing anyway");
                    }
                }
                if matches!(ops.chain_exists(table, chain), Ok(true)) {
                    if let Err(error) = ops.flush_chain(table, chain).and_then(|_| ops.delete_chain(table, chain)) {
                        tracing::warn!(%error, table, chain, "failed to delete chain, continuing anyway");
                    }
                }
            }
        }
        self.inbound.clear();
        if self.active.take().is_some() {
            tracing::info!("firewall down");
        }
    }

    /// Marks UDP packets coming back from `server` so that reverse path
    /// filtering accepts them on the physical interface.
    pub fn mark_inbound(&mut self, server: IpAddr) -> Result<(), Error> {
        let Some(active) = self.active.clone() else {
            return Err(Error::General("firewall is not up".into()));
        };
        if self.inbound.contains(&server) {
            return Ok(());
        }
        let Some(ops) = self.family_of(&server) else {
            tracing::debug!(%server, "no ip6tables backend, skipping inbound mark");
            return Ok(());
        };
        ops.append(TABLE_MANGLE, CHAIN_PREROUTING, &inbound_rule(&server, &active))
            .map_err(ipt_err)?;
        self.inbound.insert(server);
        Ok(())
    }

    pub fn clear_inbound(&mut self, server: IpAddr) -> Result<(), Error> {
        if !self.inbound.remove(&server) {
            return Ok(());
        }
        let (Some(active), Some(ops)) = (self.active.clone(), self.family_of(&server)) else {
            return Ok(());
        };
        ops.delete(TABLE_MANGLE, CHAIN_PREROUTING, &inbound_rule(&server, &active))
            .map_err(ipt_err)
    }

    /// Marks traffic of every process in the net_cls class `classid`.
    pub fn mark_cgroup_v1(&mut self, classid: u32) -> Result<(), Error> {
        if self.cgroup_v1 == Some(classid) {
            return Ok(());
        }
        if let Some(previous) = self.cgroup_v1.take() {
            self.apply_cgroup(&CgroupMatch::ClassId(previous), false)?;
        }
        self.apply_cgroup(&CgroupMatch::ClassId(classid), true)?;
        self.cgroup_v1 = Some(classid);
        Ok(())
    }

    /// Marks traffic of every process below the unified hierarchy path.
    pub fn mark_cgroup_v2(&mut self, path: &str) -> Result<(), Error> {
        if self.cgroup_v2.contains(path) {
            return Ok(());
        }
        self.apply_cgroup(&CgroupMatch::Path(path.to_string()), true)?;
        self.cgroup_v2.insert(path.to_string());
        Ok(())
    }

    pub fn clear_cgroup_v2(&mut self, path: &str) -> Result<(), Error> {
        if !self.cgroup_v2.remove(path) {
            return Ok(());
        }
        self.apply_cgroup(&CgroupMatch::Path(path.to_string()), false)
    }

    pub fn clear_all_cgroups_v2(&mut self) -> Result<(), Error> {
        let paths: Vec<String> = self.cgroup_v2.iter().cloned().collect();
        let mut first_error = None;
        for path in paths {
            if let Err(e) = self.clear_cgroup_v2(&path) {
                tracing::warn!(error = %e, path, "failed to clear cgroup mark");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn marked_cgroups_v2(&self) -> impl Iterator<Item = &String> {
        self.cgroup_v2.iter()
    }

    /// Adds or removes the mark and masquerade rule pair for one cgroup.
    /// Only touches iptables while the tunnel is up.
    fn apply_cgroup(&self, cgroup: &CgroupMatch, add: bool) -> Result<(), Error> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        let matcher = cgroup.matcher();
        let mark = format!("{matcher} -j MARK --set-mark {:#x}", active.fwmark);
        let masq = format!("{matcher} ! -o {} -j MASQUERADE", active.ifname);
        for ops in self.families() {
            if add {
                ops.insert(TABLE_MANGLE, CHAIN_OUTPUT, &mark, 2).map_err(ipt_err)?;
                ops.append(TABLE_NAT, CHAIN_NAT, &masq).map_err(ipt_err)?;
            } else {
                ops.delete(TABLE_MANGLE, CHAIN_OUTPUT, &mark).map_err(ipt_err)?;
                ops.delete(TABLE_NAT, CHAIN_NAT, &masq).map_err(ipt_err)?;
            }
        }
        Ok(())
    }
}

fn inbound_rule(server: &IpAddr, active: &Active) -> String {
    format!(
        "-p udp -s {server} ! -i {} -j MARK --set-mark {:#x}",
        active.ifname, active.fwmark
    )
}

fn install_chains<I: IptablesOps>(ops: &I, active: &Active) -> IptablesResult<()> {
    for (table, builtin, chain) in HOOKS {
        if ops.chain_exists(table, chain)? {
            ops.flush_chain(table, chain)?;
        } else {
            ops.new_chain(table, chain)?;
        }
        let jump = format!("-j {chain}");
        if !ops.exists(table, builtin, &jump)? {
            ops.insert(table, builtin, &jump, 1)?;
        }
    }

    let mark = format!("{:#x}", active.fwmark);
    // established bypass flows keep their mark; cgroup rules are inserted
    // between these two
    ops.append(
        TABLE_MANGLE,
        CHAIN_OUTPUT,
        &format!("-m connmark --mark {mark} -j MARK --set-mark {mark}"),
    )?;
    ops.append(
        TABLE_MANGLE,
        CHAIN_OUTPUT,
        &format!("-m mark --mark {mark} -j CONNMARK --save-mark"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::mocks::{IptablesState, MockIptablesOps};

    fn firewall() -> (Firewall<MockIptablesOps>, MockIptablesOps, MockIptablesOps) {
        let v4 = MockIptablesOps::new(false);
        let v6 = MockIptablesOps::new(true);
        (Firewall::new(v4.clone(), Some(v6.clone())), v4, v6)
    }

    fn rules(ops: &MockIptablesOps, table: &str, chain: &str) -> Vec<String> {
        ops.state.lock().unwrap().rules(table, chain)
    }

    #[test]
    fn up_creates_and_hooks_chains_for_both_families() -> anyhow::Result<()> {
        let (mut fw, v4, v6) = firewall();
        fw.up("moz0", 0xca6c)?;

        for ops in [&v4, &v6] {
            assert_eq!(rules(ops, "mangle", "OUTPUT"), vec!["-j MOZVPN_OUTPUT"]);
            assert_eq!(rules(ops, "mangle", "PREROUTING"), vec!["-j MOZVPN_PREROUTING"]);
            assert_eq!(rules(ops, "nat", "POSTROUTING"), vec!["-j MOZVPN_NAT"]);
            assert_eq!(rules(ops, "mangle", "MOZVPN_OUTPUT").len(), 2);
        }
        assert!(fw.is_up());
        Ok(())
    }

    #[test]
    fn down_is_idempotent_and_leaves_nothing() -> anyhow::Result<()> {
        let (mut fw, v4, _v6) = firewall();
        fw.up("moz0", 0xca6c)?;
        fw.mark_inbound("185.65.135.1".parse()?)?;
        fw.down();
        fw.down();

        let state = v4.state.lock().unwrap();
        assert!(!state.chains.contains_key(&("mangle".to_string(), "MOZVPN_OUTPUT".to_string())));
        assert!(state.rules("mangle", "OUTPUT").is_empty());
        assert!(state.rules("nat", "POSTROUTING").is_empty());
        Ok(())
    }

    #[test]
    fn inbound_marks_follow_address_family() -> anyhow::Result<()> {
        let (mut fw, v4, v6) = firewall();
        fw.up("moz0", 0xca6c)?;
        fw.mark_inbound("185.65.135.1".parse()?)?;
        fw.mark_inbound("185.65.135.1".parse()?)?;
        fw.mark_inbound("2a03:1b20::1".parse()?)?;

        assert_eq!(
            rules(&v4, "mangle", "MOZVPN_PREROUTING"),
            vec!["-p udp -s 185.65.135.1 ! -i moz0 -j MARK --set-mark 0xca6c"]
        );
        assert_eq!(rules(&v6, "mangle", "MOZVPN_PREROUTING").len(), 1);

        fw.clear_inbound("185.65.135.1".parse()?)?;
        assert!(rules(&v4, "mangle", "MOZVPN_PREROUTING").is_empty());
        Ok(())
    }

    #[test]
    fn cgroup_marks_survive_a_down_up_cycle() -> anyhow::Result<()> {
        let (mut fw, v4, _v6) = firewall();
        fw.mark_cgroup_v2("/user.slice/app.scope")?;
        assert!(rules(&v4, "mangle", "MOZVPN_OUTPUT").is_empty());

        fw.up("moz0", 0xca6c)?;
        let output = rules(&v4, "mangle", "MOZVPN_OUTPUT");
        assert_eq!(output.len(), 3);
        assert_eq!(output[1], "-m cgroup --path /user.slice/app.scope -j MARK --set-mark 0xca6c");
        assert_eq!(
            rules(&v4, "nat", "MOZVPN_NAT"),
            vec!["-m cgroup --path /user.slice/app.scope ! -o moz0 -j MASQUERADE"]
        );

        fw.clear_cgroup_v2("/user.slice/app.scope")?;
        assert_eq!(rules(&v4, "mangle", "MOZVPN_OUTPUT").len(), 2);
        assert!(rules(&v4, "nat", "MOZVPN_NAT").is_empty());
        Ok(())
    }

    #[test]
    fn classid_rule_uses_hex_classid() -> anyhow::Result<()> {
        let (mut fw, v4, _v6) = firewall();
        fw.up("moz0", 0xca6c)?;
        fw.mark_cgroup_v1(0x0011_0011)?;
        assert!(
            rules(&v4, "mangle", "MOZVPN_OUTPUT")
                .contains(&"-m cgroup --cgroup 0x00110011 -j MARK --set-mark 0xca6c".to_string())
        );
        Ok(())
    }

    #[test]
    fn failed_up_rolls_back() -> anyhow::Result<()> {
        let v4 = MockIptablesOps::with_state(false, IptablesState::failing("new_chain:MOZVPN_NAT"));
        let mut fw = Firewall::new(v4.clone(), None);
        assert!(fw.up("moz0", 0xca6c).is_err());
        assert!(!fw.is_up());
        assert!(rules(&v4, "mangle", "OUTPUT").is_empty());
        Ok(())
    }
}
