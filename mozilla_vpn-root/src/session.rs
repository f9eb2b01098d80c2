//! Who may drive the tunnel over the daemon socket.
//!
//! The first unprivileged user to initialize or activate owns the session
//! until the tunnel goes down. Root is always let through. While a tunnel is
//! up nobody else can open a session, even if the owner was forgotten.

use mozilla_vpn_lib::command::Command;

pub const ROOT_UID: u32 = 0;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DaemonSession {
    owner: Option<u32>,
}

/// Outcome of [`DaemonSession::authorize`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decision {
    Allow,
    Deny,
}

impl DaemonSession {
    /// Fails when a session is already running.
    pub fn start(&mut self, uid: u32) -> bool {
        if self.owner.is_some() {
            return false;
        }
        tracing::debug!(uid, "daemon session started");
        self.owner = Some(uid);
        true
    }

    pub fn is_active(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    /// A peer without known credentials counts as root.
    pub fn is_peer_authorized(&self, uid: Option<u32>) -> bool {
        match (self.owner, uid) {
            (None, _) => false,
            (_, None) | (_, Some(ROOT_UID)) => true,
            (Some(owner), Some(uid)) => owner == uid,
        }
    }

    pub fn reset(&mut self) {
        if let Some(uid) = self.owner.take() {
            tracing::debug!(uid, "daemon session reset");
        }
    }

    /// Gate for one incoming command, starting the session when the command
    /// opens one.
    pub fn authorize(&mut self, cmd: &Command, uid: Option<u32>, tunnel_active: bool) -> Decision {
        if matches!(uid, None | Some(ROOT_UID)) || self.is_peer_authorized(uid) {
            return Decision::Allow;
        }
        if self.is_active() || tunnel_active {
            return Decision::Deny;
        }
        match (cmd, uid) {
            (Command::Status, _) => Decision::Allow,
            (Command::Activate(_) | Command::Initialize(_), Some(uid)) => {
                self.start(uid);
                Decision::Allow
            }
            _ => Decision::Deny,
        }
    }
}
