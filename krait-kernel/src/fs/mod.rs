//! Filesystem seam
//!
//! The socket layer needs very little from the VFS: an `open` that can
//! create-exclusive a socket node, an inode that can hold a socket
//! binding, and file descriptions to hand around. This module defines
//! those shapes; the real filesystem lives elsewhere and is installed
//! into the process-wide slot at boot.
//!
//! # Inode / socket cycle
//!
//! A bound socket owns its backing file strongly; the inode only holds a
//! `Weak` back-pointer to the socket. When the socket is destroyed the
//! binding evaporates on its own and the path becomes bindable again.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::error::KResult;
use crate::net::local_socket::LocalSocket;
use crate::process::Process;
use crate::sched::Blocker;

#[cfg(test)]
pub(crate) mod mock;

/// Flags for [`Filesystem::open`].
///
/// # Layout
///
/// - Bit 0: ReadWrite
/// - Bit 1: Create
/// - Bit 2: Exclusive (with Create: fail if the path exists)
/// - Bit 3: NoFollow (do not traverse a trailing symlink)
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(transparent)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// No flags.
    pub const NONE: Self = Self(0);

    /// Open for reading and writing.
    pub const READ_WRITE: Self = Self(1 << 0);

    /// Create the path if it does not exist.
    pub const CREATE: Self = Self(1 << 1);

    /// With [`CREATE`](Self::CREATE): fail if the path already exists.
    pub const EXCLUSIVE: Self = Self(1 << 2);

    /// Refuse to traverse a trailing symbolic link.
    pub const NO_FOLLOW: Self = Self(1 << 3);

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if all flags in `other` are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Flags present in either operand.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// File mode: type bits plus permission bits, unix layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(transparent)]
pub struct Mode(u32);

impl Mode {
    const TYPE_MASK: u32 = 0o170_000;

    /// No bits set.
    pub const NONE: Self = Self(0);

    /// The socket file type.
    pub const SOCKET: Self = Self(0o140_000);

    /// Create a mode from raw bits.
    #[inline]
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Only the permission bits.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        Self(self.0 & 0o777)
    }

    /// Check for the socket file type.
    #[inline]
    #[must_use]
    pub const fn is_socket(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::SOCKET.0
    }

    /// Bits present in either operand.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Ownership applied to a newly created node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Owner {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

/// The slice of an inode the socket layer interacts with.
pub struct Inode {
    mode: Mutex<Mode>,
    owner: Mutex<Owner>,
    bound_socket: Mutex<Weak<LocalSocket>>,
}

impl Inode {
    /// Create an inode with the given mode and owner.
    #[must_use]
    pub fn new(mode: Mode, owner: Owner) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            owner: Mutex::new(owner),
            bound_socket: Mutex::new(Weak::new()),
        })
    }

    /// Associate a socket with this inode.
    ///
    /// Returns `false` if another live socket is already bound here. A
    /// binding whose socket has since been destroyed does not count.
    pub fn bind_socket(&self, socket: &Arc<LocalSocket>) -> bool {
        let mut bound = self.bound_socket.lock();
        if bound.upgrade().is_some() {
            return false;
        }
        *bound = Arc::downgrade(socket);
        true
    }

    /// The socket bound to this inode, if it is still alive.
    #[must_use]
    pub fn socket(&self) -> Option<Arc<LocalSocket>> {
        self.bound_socket.lock().upgrade()
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    /// Current owner.
    #[must_use]
    pub fn owner(&self) -> Owner {
        *self.owner.lock()
    }

    /// Replace the permission bits, keeping the file type.
    pub fn chmod(&self, mode: Mode) -> KResult<()> {
        let mut current = self.mode.lock();
        *current = Mode::new(current.bits() & Mode::TYPE_MASK).union(mode.permissions());
        Ok(())
    }

    /// Replace the owner.
    pub fn chown(&self, uid: u32, gid: u32) -> KResult<()> {
        *self.owner.lock() = Owner { uid, gid };
        Ok(())
    }
}

/// What an open file description refers to.
enum Target {
    Inode(Arc<Inode>),
    Socket(Arc<LocalSocket>),
}

/// Description ids only need to be unique; a counter suffices.
static NEXT_DESCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// An open file description.
///
/// Carries the per-open state the socket layer keys on: a stable id (the
/// socket tags its connect side by id), the blocking flag, and the
/// interruption rendezvous used when a thread sleeps on this description.
pub struct FileDescription {
    id: u64,
    blocking: AtomicBool,
    target: Target,
    current_blocker: Mutex<Option<Arc<Blocker>>>,
    pending_interrupt: AtomicBool,
}

impl FileDescription {
    fn new(target: Target) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_DESCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            blocking: AtomicBool::new(true),
            target,
            current_blocker: Mutex::new(None),
            pending_interrupt: AtomicBool::new(false),
        })
    }

    /// Create a description for a filesystem node.
    #[must_use]
    pub fn new_for_inode(inode: Arc<Inode>) -> Arc<Self> {
        Self::new(Target::Inode(inode))
    }

    /// Create a description for a socket endpoint and attach it.
    ///
    /// Attachment happens before the description is handed out, so the
    /// socket's connect-side bookkeeping is complete by the time anyone
    /// can issue an operation through it.
    pub fn open_socket(socket: Arc<LocalSocket>) -> KResult<Arc<Self>> {
        let description = Self::new(Target::Socket(socket.clone()));
        socket.attach(&description)?;
        Ok(description)
    }

    /// The unique id of this description.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether operations through this description may sleep.
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// Switch between blocking and non-blocking operation.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// The backing inode, for filesystem descriptions.
    #[must_use]
    pub fn inode(&self) -> Option<&Arc<Inode>> {
        match &self.target {
            Target::Inode(inode) => Some(inode),
            Target::Socket(_) => None,
        }
    }

    /// The socket endpoint, for socket descriptions.
    #[must_use]
    pub fn socket(&self) -> Option<&Arc<LocalSocket>> {
        match &self.target {
            Target::Socket(socket) => Some(socket),
            Target::Inode(_) => None,
        }
    }

    /// Change permission bits of the target.
    pub fn chmod(&self, mode: Mode) -> KResult<()> {
        match &self.target {
            Target::Inode(inode) => inode.chmod(mode),
            Target::Socket(socket) => socket.chmod(mode),
        }
    }

    /// Change ownership of the target.
    pub fn chown(&self, process: &Process, uid: u32, gid: u32) -> KResult<()> {
        match &self.target {
            Target::Inode(inode) => inode.chown(uid, gid),
            Target::Socket(socket) => socket.chown(process, uid, gid),
        }
    }

    /// Deliver a thread interruption to whoever is blocked on this
    /// description. If nobody is blocked yet, the interrupt stays pending
    /// and cancels the next blocking attempt.
    pub fn interrupt(&self) {
        let blocker = self.current_blocker.lock().clone();
        match blocker {
            Some(blocker) => blocker.interrupt(),
            None => self.pending_interrupt.store(true, Ordering::Release),
        }
    }

    /// Register `blocker` as the suspension point for this description.
    ///
    /// Returns `false` if a pending interrupt was consumed instead, in
    /// which case the caller must not wait.
    pub(crate) fn begin_block(&self, blocker: &Arc<Blocker>) -> bool {
        *self.current_blocker.lock() = Some(blocker.clone());
        if self.pending_interrupt.swap(false, Ordering::AcqRel) {
            *self.current_blocker.lock() = None;
            return false;
        }
        true
    }

    /// Clear the suspension point after a wait finishes.
    pub(crate) fn end_block(&self) {
        *self.current_blocker.lock() = None;
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        if let Target::Socket(socket) = &self.target {
            socket.detach(self);
        }
    }
}

/// The narrow view of the virtual filesystem the socket layer requires.
pub trait Filesystem: Send + Sync {
    /// Open `path` (relative paths resolve against `cwd`).
    ///
    /// With `CREATE | EXCLUSIVE`, an existing path fails with
    /// `AlreadyExists`; a created node gets `mode` and, when given,
    /// `owner`.
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: Mode,
        cwd: &str,
        owner: Option<Owner>,
    ) -> KResult<Arc<FileDescription>>;
}

static VFS: Once<&'static dyn Filesystem> = Once::new();

/// Install the filesystem implementation. Only the first call takes
/// effect.
pub fn install(filesystem: &'static dyn Filesystem) {
    VFS.call_once(|| filesystem);
}

/// The installed filesystem.
///
/// # Panics
///
/// Panics if no filesystem has been installed; socket paths cannot exist
/// before the VFS is up.
#[must_use]
pub fn the() -> &'static dyn Filesystem {
    *VFS.get().expect("fs: no filesystem installed")
}
