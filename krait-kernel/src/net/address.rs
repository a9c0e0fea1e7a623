//! Local-domain socket addresses
//!
//! The classic `sockaddr_un` layout: a 16-bit family tag followed by a
//! fixed path buffer. The path is nominally NUL-terminated, but nothing
//! stops user space from filling the whole buffer, so every consumer here
//! scans for the terminator instead of trusting it.

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{KResult, KernelError};

/// The local (unix) address family.
pub const AF_LOCAL: u16 = 1;

/// Size of the embedded path buffer, terminator included.
pub const SUN_PATH_LEN: usize = 108;

/// A local-domain socket address.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SocketAddressUnix {
    /// Address family; must be [`AF_LOCAL`].
    pub family: u16,
    /// Filesystem path, NUL-terminated when shorter than the buffer.
    pub path: [u8; SUN_PATH_LEN],
}

impl SocketAddressUnix {
    /// Build a local address from a path, truncating to the buffer size.
    #[must_use]
    pub fn local(path: &str) -> Self {
        let mut buffer = [0u8; SUN_PATH_LEN];
        let bytes = path.as_bytes();
        let len = bytes.len().min(SUN_PATH_LEN - 1);
        buffer[..len].copy_from_slice(&bytes[..len]);
        Self {
            family: AF_LOCAL,
            path: buffer,
        }
    }

    /// The path bytes up to (not including) the first NUL.
    #[must_use]
    pub fn path_bytes(&self) -> &[u8] {
        let len = self
            .path
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(SUN_PATH_LEN);
        &self.path[..len]
    }

    /// The path as UTF-8, rejecting undecodable bytes.
    pub fn path_str(&self) -> KResult<&str> {
        core::str::from_utf8(self.path_bytes()).map_err(|_| KernelError::InvalidArgument)
    }
}

impl Default for SocketAddressUnix {
    fn default() -> Self {
        Self {
            family: 0,
            path: [0; SUN_PATH_LEN],
        }
    }
}

impl fmt::Debug for SocketAddressUnix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SocketAddressUnix(family={}, path={:?})",
            self.family,
            core::str::from_utf8(self.path_bytes()).unwrap_or("<non-utf8>")
        )
    }
}
