//! Classification through the cgroup filesystems, with iptables doing the
//! marking.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{Error, SplitTunnel, cgroup_dir};
use crate::routing::firewall::SharedFirewall;
use crate::routing::iptables_ops::IptablesOps;

/// Name of the net_cls group excluded processes are moved into.
pub const EXCLUDE_GROUP: &str = "mozvpn.exclude";
/// net_cls class id of [`EXCLUDE_GROUP`] (`0x0011:0x0011`).
pub const EXCLUDE_CLASSID: u32 = 0x0011_0011;

const PROCS: &str = "cgroup.procs";
const CLASSID: &str = "net_cls.classid";

/// Moves every process listed in `from` into `to`. Processes exiting in
/// between are skipped. Returns how many were moved.
pub async fn move_procs(from: &Path, to: &Path) -> Result<usize, Error> {
    let content = match tokio::fs::read_to_string(from).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let pids: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if pids.is_empty() {
        return Ok(0);
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(to)
        .await?;
    let mut moved = 0;
    // the kernel takes one pid per write
    for pid in pids {
        match file.write_all(format!("{pid}\n").as_bytes()).await {
            Ok(()) => moved += 1,
            Err(error) => tracing::debug!(%error, pid, "unable to move process"),
        }
        file.flush().await?;
    }
    Ok(moved)
}

/// cgroup v1: excluded processes join a dedicated net_cls class.
///
/// Children forked inside the class inherit it. Processes placed into an
/// excluded unified cgroup from elsewhere are moved by [`SplitTunnel::sync`].
pub struct NetClsSplitTunnel {
    net_cls: PathBuf,
    unified: PathBuf,
    excluded: BTreeSet<String>,
}

impl NetClsSplitTunnel {
    /// Creates the exclusion class and registers its mark with the firewall.
    pub async fn setup<I: IptablesOps>(
        net_cls: PathBuf,
        unified: PathBuf,
        firewall: SharedFirewall<I>,
    ) -> Result<Self, Error> {
        let group = net_cls.join(EXCLUDE_GROUP);
        tokio::fs::create_dir_all(&group).await?;
        tokio::fs::write(group.join(CLASSID), EXCLUDE_CLASSID.to_string()).await?;
        firewall.lock().await.mark_cgroup_v1(EXCLUDE_CLASSID)?;
        tracing::debug!(group = %group.display(), "net_cls exclusion class ready");
        Ok(NetClsSplitTunnel {
            net_cls,
            unified,
            excluded: BTreeSet::new(),
        })
    }

    fn exclude_procs(&self) -> PathBuf {
        self.net_cls.join(EXCLUDE_GROUP).join(PROCS)
    }

    fn root_procs(&self) -> PathBuf {
        self.net_cls.join(PROCS)
    }
}

#[async_trait]
impl SplitTunnel for NetClsSplitTunnel {
    fn kind(&self) -> &'static str {
        "net_cls"
    }

    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        let source = cgroup_dir(&self.unified, cgroup)?.join(PROCS);
        let moved = move_procs(&source, &self.exclude_procs()).await?;
        tracing::debug!(cgroup, moved, "cgroup excluded");
        self.excluded.insert(cgroup.to_string());
        Ok(())
    }

    async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        let source = cgroup_dir(&self.unified, cgroup)?.join(PROCS);
        let moved = move_procs(&source, &self.root_procs()).await?;
        tracing::debug!(cgroup, moved, "cgroup reset");
        self.excluded.remove(cgroup);
        Ok(())
    }

    async fn reset_all(&mut self) -> Result<(), Error> {
        let moved = move_procs(&self.exclude_procs(), &self.root_procs()).await?;
        tracing::debug!(moved, "all cgroups reset");
        self.excluded.clear();
        Ok(())
    }

    fn excluded(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }

    fn needs_sync(&self) -> bool {
        true
    }

    async fn sync(&mut self) -> Result<(), Error> {
        let target = self.exclude_procs();
        for cgroup in self.excluded.iter() {
            let source = cgroup_dir(&self.unified, cgroup)?.join(PROCS);
            let moved = move_procs(&source, &target).await?;
            tracing::trace!(cgroup, moved, "cgroup synced");
        }
        Ok(())
    }
}

/// cgroup v2 without eBPF: one iptables match per excluded path.
pub struct FirewallSplitTunnel<I: IptablesOps> {
    unified: PathBuf,
    firewall: SharedFirewall<I>,
}

impl<I: IptablesOps> FirewallSplitTunnel<I> {
    pub fn new(unified: PathBuf, firewall: SharedFirewall<I>) -> Self {
        FirewallSplitTunnel { unified, firewall }
    }
}

#[async_trait]
impl<I: IptablesOps + 'static> SplitTunnel for FirewallSplitTunnel<I> {
    fn kind(&self) -> &'static str {
        "cgroup2-iptables"
    }

    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        cgroup_dir(&self.unified, cgroup)?;
        self.firewall.lock().await.mark_cgroup_v2(cgroup)?;
        Ok(())
    }

    async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        self.firewall.lock().await.clear_cgroup_v2(cgroup)?;
        Ok(())
    }

    async fn reset_all(&mut self) -> Result<(), Error> {
        self.firewall.lock().await.clear_all_cgroups_v2()?;
        Ok(())
    }

    fn excluded(&self) -> Vec<String> {
        // only called from the control loop, never while the firewall is held
        match self.firewall.try_lock() {
            Ok(firewall) => firewall.marked_cgroups_v2().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
