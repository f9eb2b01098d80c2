//! Per-application split tunnelling.
//!
//! Processes are identified by their control group. Excluding a cgroup gives
//! every socket its processes create the bypass mark so their traffic skips
//! the tunnel table. One mechanism is chosen at startup:
//!
//! 1. cgroup v1 `net_cls`: PIDs are moved into a dedicated class, matched by
//!    iptables (the kernel gives `net_cls` priority over cgroup v2 matching)
//!    and re-synced while exclusions exist,
//! 2. cgroup v2 with an eBPF socket-create hook setting the mark,
//! 3. cgroup v2 matched by iptables when eBPF cannot be loaded,
//! 4. nothing.

use async_trait::async_trait;
use thiserror::Error;

use std::path::{Component, Path, PathBuf};

use mozilla_vpn_lib::config::{Config, SplitTunnelMode};

use crate::routing;
use crate::routing::firewall::SharedFirewall;
use crate::routing::iptables_ops::IptablesOps;

pub mod bpf;
pub mod cgroup;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Routing(#[from] routing::Error),
    #[error("invalid cgroup path `{0}`")]
    InvalidCgroup(String),
    #[error("bpf {op} failed: {source}")]
    Bpf {
        op: &'static str,
        source: std::io::Error,
    },
    #[error("split tunnelling unavailable: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait SplitTunnel: Send + Sync {
    /// Short mechanism name for logs.
    fn kind(&self) -> &'static str;
    /// Idempotent.
    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error>;
    async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), Error>;
    async fn reset_all(&mut self) -> Result<(), Error>;
    fn excluded(&self) -> Vec<String>;
    /// Mechanisms that classify a snapshot of processes must be synced
    /// periodically to catch processes that joined an excluded cgroup later.
    fn needs_sync(&self) -> bool {
        false
    }
    async fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// cgroup mount points found in the mount table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mounts {
    pub net_cls: Option<PathBuf>,
    pub unified: Option<PathBuf>,
}

/// Parses `/proc/self/mounts` formatted content.
pub fn parse_mounts(content: &str) -> Mounts {
    let mut mounts = Mounts::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_, mount_point, fs_type, options, ..] = fields.as_slice() else {
            continue;
        };
        match *fs_type {
            "cgroup2" if mounts.unified.is_none() => {
                mounts.unified = Some(PathBuf::from(unescape_mount(mount_point)));
            }
            "cgroup" if mounts.net_cls.is_none() && options.split(',').any(|o| o == "net_cls") => {
                mounts.net_cls = Some(PathBuf::from(unescape_mount(mount_point)));
            }
            _ => {}
        }
    }
    mounts
}

/// Decodes the octal escapes (`\040` for space) of the mount table.
fn unescape_mount(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    NetCls { net_cls: PathBuf, unified: PathBuf },
    Unified(PathBuf),
    Disabled,
}

/// `net_cls` wins when both hierarchies are mounted.
pub fn select(mounts: &Mounts, mode: SplitTunnelMode) -> Selection {
    if mode == SplitTunnelMode::Disabled {
        return Selection::Disabled;
    }
    match (&mounts.net_cls, &mounts.unified) {
        (Some(net_cls), Some(unified)) => Selection::NetCls {
            net_cls: net_cls.clone(),
            unified: unified.clone(),
        },
        (None, Some(unified)) => Selection::Unified(unified.clone()),
        (Some(_), None) => {
            tracing::warn!("net_cls is mounted without a unified hierarchy to find processes in");
            Selection::Disabled
        }
        (None, None) => Selection::Disabled,
    }
}

/// Resolves a cgroup as reported by the client (rooted at the unified
/// hierarchy) below `root`, refusing anything that escapes it.
pub fn cgroup_dir(root: &Path, cgroup: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(cgroup.trim_start_matches('/'));
    let valid = !cgroup.trim().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(Error::InvalidCgroup(cgroup.to_string()));
    }
    Ok(root.join(relative))
}

/// Probes the system and builds the classifier for this daemon instance.
pub async fn create<I: IptablesOps + 'static>(config: &Config, firewall: SharedFirewall<I>) -> Box<dyn SplitTunnel> {
    let mounts = match tokio::fs::read_to_string(&config.cgroup_mounts).await {
        Ok(content) => parse_mounts(&content),
        Err(error) => {
            tracing::warn!(%error, path = %config.cgroup_mounts.display(), "unable to read mount table");
            Mounts::default()
        }
    };

    match select(&mounts, config.split_tunnel) {
        Selection::NetCls { net_cls, unified } => {
            match cgroup::NetClsSplitTunnel::setup(net_cls, unified, firewall).await {
                Ok(split) => {
                    tracing::info!("split tunnelling with net_cls cgroups (v1)");
                    Box::new(split)
                }
                Err(error) => {
                    tracing::warn!(%error, "unable to set up net_cls split tunnelling");
                    Box::new(Disabled)
                }
            }
        }
        Selection::Unified(unified) => match bpf::BpfSplitTunnel::load(unified.clone(), config.fwmark) {
            Ok(split) => {
                tracing::info!("split tunnelling with unified cgroups (v2) and eBPF");
                Box::new(split)
            }
            Err(error) => {
                tracing::warn!(%error, "eBPF unavailable, matching unified cgroups with iptables");
                Box::new(cgroup::FirewallSplitTunnel::new(unified, firewall))
            }
        },
        Selection::Disabled => {
            tracing::warn!("split tunnelling disabled: no supported cgroup hierarchy");
            Box::new(Disabled)
        }
    }
}

pub struct Disabled;

#[async_trait]
impl SplitTunnel for Disabled {
    fn kind(&self) -> &'static str {
        "disabled"
    }

    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        Err(Error::Unsupported(format!("cannot exclude {cgroup}")))
    }

    async fn reset_cgroup(&mut self, _cgroup: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn reset_all(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn excluded(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
cgroup2 /sys/fs/cgroup/unified cgroup2 rw,nosuid,nodev,noexec,relatime,nsdelegate 0 0
cgroup /sys/fs/cgroup/cpu,cpuacct cgroup rw,nosuid,nodev,noexec,relatime,cpu,cpuacct 0 0
cgroup /sys/fs/cgroup/net_cls,net_prio cgroup rw,nosuid,nodev,noexec,relatime,net_cls,net_prio 0 0
";

    #[test]
    fn finds_both_hierarchies() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.unified, Some(PathBuf::from("/sys/fs/cgroup/unified")));
        assert_eq!(mounts.net_cls, Some(PathBuf::from("/sys/fs/cgroup/net_cls,net_prio")));
    }

    #[test]
    fn net_cls_takes_priority() {
        let mounts = parse_mounts(MOUNTS);
        assert!(matches!(select(&mounts, SplitTunnelMode::Auto), Selection::NetCls { .. }));
        assert_eq!(select(&mounts, SplitTunnelMode::Disabled), Selection::Disabled);

        let unified_only = parse_mounts("cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid 0 0");
        assert_eq!(
            select(&unified_only, SplitTunnelMode::Auto),
            Selection::Unified(PathBuf::from("/sys/fs/cgroup"))
        );
        assert_eq!(select(&Mounts::default(), SplitTunnelMode::Auto), Selection::Disabled);
    }

    #[test]
    fn mount_escapes_are_decoded() {
        let mounts = parse_mounts("cgroup2 /mnt/my\\040cgroups cgroup2 rw 0 0");
        assert_eq!(mounts.unified, Some(PathBuf::from("/mnt/my cgroups")));
    }

    #[test]
    fn cgroup_paths_stay_below_the_root() -> anyhow::Result<()> {
        let root = Path::new("/sys/fs/cgroup");
        assert_eq!(
            cgroup_dir(root, "/user.slice/app-firefox.scope")?,
            PathBuf::from("/sys/fs/cgroup/user.slice/app-firefox.scope")
        );
        assert!(cgroup_dir(root, "/user.slice/../../etc").is_err());
        assert!(cgroup_dir(root, "").is_err());
        assert!(cgroup_dir(root, "/").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_refuses_exclusions() -> anyhow::Result<()> {
        let mut split = Disabled;
        assert!(split.exclude_cgroup("/user.slice/app.scope").await.is_err());
        split.reset_cgroup("/user.slice/app.scope").await?;
        split.reset_all().await?;
        assert!(split.excluded().is_empty());
        Ok(())
    }
}
