//! Process identity
//!
//! The socket layer needs to know who is calling: pre-bind ownership,
//! peer-credential snapshots and the `chown` privilege check all derive
//! from the caller's identity. Operations take the calling [`Process`]
//! explicitly; there is no ambient current-process global here, the
//! scheduler owns that notion.

use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Peer credentials: the `(pid, uid, gid)` triple captured at connection
/// establishment and reported by `SO_PEERCRED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Credentials {
    /// Process id.
    pub pid: i32,
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

/// The identity of a calling process.
#[derive(Clone, Debug)]
pub struct Process {
    pid: i32,
    euid: u32,
    egid: u32,
    groups: Vec<u32>,
    cwd: String,
}

impl Process {
    /// Create a process identity with no supplementary groups and `/` as
    /// the working directory.
    #[must_use]
    pub fn new(pid: i32, euid: u32, egid: u32) -> Self {
        Self {
            pid,
            euid,
            egid,
            groups: Vec::new(),
            cwd: String::from("/"),
        }
    }

    /// Replace the supplementary group list.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    /// Replace the current working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: String) -> Self {
        self.cwd = cwd;
        self
    }

    /// Process id.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Effective user id.
    #[inline]
    #[must_use]
    pub fn euid(&self) -> u32 {
        self.euid
    }

    /// Effective group id.
    #[inline]
    #[must_use]
    pub fn egid(&self) -> u32 {
        self.egid
    }

    /// Current working directory, used for relative path resolution.
    #[inline]
    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Check for superuser privilege.
    #[inline]
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.euid == 0
    }

    /// Check membership of `gid`, counting the effective group.
    #[must_use]
    pub fn in_group(&self, gid: u32) -> bool {
        self.egid == gid || self.groups.contains(&gid)
    }

    /// Snapshot this process's credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            pid: self.pid,
            uid: self.euid,
            gid: self.egid,
        }
    }
}
