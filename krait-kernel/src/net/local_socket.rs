//! Local socket endpoints
//!
//! One `LocalSocket` object backs a whole connection: the connector's
//! description and the acceptor's description both point at it, and the
//! role of each description decides which of the two byte pipes it sends
//! into and receives from:
//!
//! - `Connected` (connector) sends into `for_server`, receives from
//!   `for_client`.
//! - `Accepted` (acceptor) sends into `for_client`, receives from
//!   `for_server`.
//!
//! The passed-description queues mirror the same cross-wiring. A
//! listening socket is a separate object that only carries the pending
//! connection queue; `accept` hands back the connector's socket object
//! with the acceptor side marked open.
//!
//! Blocking works through one mechanism: any state transition funnels
//! into [`LocalSocket::evaluate_block_conditions`], which re-checks every
//! parked waiter against the current readiness of its description and
//! wakes the ones whose condition fired. The byte pipes call back into
//! the same place from their unblock hooks.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem::size_of;

use spin::{Mutex, Once, RwLock};

use crate::double_buffer::{DoubleBuffer, DEFAULT_CAPACITY};
use crate::error::{KResult, KernelError};
use crate::fs::{self, FileDescription, Mode, OpenFlags, Owner};
use crate::net::address::{SocketAddressUnix, AF_LOCAL, SUN_PATH_LEN};
use crate::net::socket::{Role, SetupState, ShouldBlock, SocketType};
use crate::process::{Credentials, Process};
use crate::sched::{BlockFlags, BlockResult, Blocker};
use crate::usercopy::{InputBuffer, OutputBuffer, UserPtr, UserPtrMut};

/// Socket option level for socket-layer options.
pub const SOL_SOCKET: i32 = 1;

/// Socket option: peer credentials of the other endpoint.
pub const SO_PEERCRED: i32 = 17;

/// Upper bound on in-flight passed descriptions per direction.
pub const MAX_QUEUED_DESCRIPTIONS: usize = 16;

// -- Global registry

static ALL_SOCKETS: Once<RwLock<Vec<Weak<LocalSocket>>>> = Once::new();

fn all_sockets() -> &'static RwLock<Vec<Weak<LocalSocket>>> {
    ALL_SOCKETS.call_once(|| RwLock::new(Vec::new()))
}

/// Visit every live local socket under the shared registry lock.
pub fn for_each(mut callback: impl FnMut(&Arc<LocalSocket>)) {
    let sockets = all_sockets().read();
    for weak in sockets.iter() {
        if let Some(socket) = weak.upgrade() {
            callback(&socket);
        }
    }
}

// -- Endpoint state

struct Inner {
    address: SocketAddressUnix,
    file: Option<Arc<FileDescription>>,
    bound: bool,
    setup_state: SetupState,
    connected: bool,
    /// Role seen by every description that is not the connect side; the
    /// listener's descriptions and the acceptor side live here.
    role: Role,
    connect_side_role: Role,
    connect_side_fd: Option<u64>,
    accept_side_fd_open: bool,
    backlog: usize,
    pending: VecDeque<Arc<LocalSocket>>,
    origin: Credentials,
    acceptor: Credentials,
    prebind_uid: u32,
    prebind_gid: u32,
    prebind_mode: Mode,
    fds_for_client: VecDeque<Arc<FileDescription>>,
    fds_for_server: VecDeque<Arc<FileDescription>>,
}

impl Inner {
    fn role_of(&self, description_id: u64) -> Role {
        if self.connect_side_fd == Some(description_id) {
            self.connect_side_role
        } else {
            self.role
        }
    }

    fn has_attached_peer(&self, role: Role) -> bool {
        match role {
            Role::Accepted => self.connect_side_fd.is_some(),
            Role::Connected => self.accept_side_fd_open,
            _ => unreachable!("peer query for role {}", role.name()),
        }
    }
}

struct BlockerEntry {
    description: u64,
    wanted: BlockFlags,
    blocker: Arc<Blocker>,
}

/// A local-domain socket endpoint.
pub struct LocalSocket {
    socket_type: SocketType,
    inner: Mutex<Inner>,
    /// Bytes travelling acceptor-to-connector.
    for_client: DoubleBuffer,
    /// Bytes travelling connector-to-acceptor.
    for_server: DoubleBuffer,
    blockers: Mutex<Vec<BlockerEntry>>,
}

impl LocalSocket {
    /// Create a detached endpoint. The caller's identity seeds the
    /// pre-bind ownership of the eventual filesystem node.
    pub fn create(socket_type: SocketType, process: &Process) -> Arc<Self> {
        let socket = Arc::new_cyclic(|weak: &Weak<LocalSocket>| {
            let for_client = DoubleBuffer::new(DEFAULT_CAPACITY);
            let this = weak.clone();
            for_client.set_unblock_callback(move || {
                if let Some(socket) = this.upgrade() {
                    socket.evaluate_block_conditions();
                }
            });

            let for_server = DoubleBuffer::new(DEFAULT_CAPACITY);
            let this = weak.clone();
            for_server.set_unblock_callback(move || {
                if let Some(socket) = this.upgrade() {
                    socket.evaluate_block_conditions();
                }
            });

            Self {
                socket_type,
                for_client,
                for_server,
                blockers: Mutex::new(Vec::new()),
                inner: Mutex::new(Inner {
                    address: SocketAddressUnix::default(),
                    file: None,
                    bound: false,
                    setup_state: SetupState::Unstarted,
                    connected: false,
                    role: Role::None,
                    connect_side_role: Role::None,
                    connect_side_fd: None,
                    accept_side_fd_open: false,
                    backlog: 0,
                    pending: VecDeque::new(),
                    origin: Credentials::default(),
                    acceptor: Credentials::default(),
                    prebind_uid: process.euid(),
                    prebind_gid: process.egid(),
                    prebind_mode: Mode::new(0o666),
                    fds_for_client: VecDeque::new(),
                    fds_for_server: VecDeque::new(),
                }),
            }
        });
        all_sockets().write().push(Arc::downgrade(&socket));
        log::debug!("LocalSocket created with type={:?}", socket_type);
        socket
    }

    /// The transport discipline of this endpoint.
    #[inline]
    #[must_use]
    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Whether the handshake has completed successfully.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Handshake progress.
    #[must_use]
    pub fn setup_state(&self) -> SetupState {
        self.inner.lock().setup_state
    }

    /// The role `description` plays on this socket.
    #[must_use]
    pub fn role(&self, description: &FileDescription) -> Role {
        self.inner.lock().role_of(description.id())
    }

    // -- Addresses

    /// The bound (or connected-to) address.
    #[must_use]
    pub fn local_address(&self) -> SocketAddressUnix {
        self.inner.lock().address
    }

    /// Local sockets report the same address for both endpoints.
    #[must_use]
    pub fn peer_address(&self) -> SocketAddressUnix {
        self.local_address()
    }

    /// The filesystem path of this socket, lossily decoded.
    #[must_use]
    pub fn socket_path(&self) -> String {
        let inner = self.inner.lock();
        String::from_utf8_lossy(inner.address.path_bytes()).into_owned()
    }

    /// Diagnostic rendering of this endpoint as seen through
    /// `description`.
    #[must_use]
    pub fn absolute_path(&self, description: &FileDescription) -> String {
        let inner = self.inner.lock();
        let path = String::from_utf8_lossy(inner.address.path_bytes());
        match inner.role_of(description.id()) {
            Role::Listener => format!("socket:{path} (listening)"),
            Role::Accepted => format!("socket:{path} (accepted from pid {})", inner.origin.pid),
            Role::Connected => {
                format!("socket:{path} (connected to pid {})", inner.acceptor.pid)
            }
            Role::Connecting => format!("socket:{path} (connecting)"),
            Role::None => format!("socket:{path}"),
        }
    }

    // -- Lifecycle: bind / listen / connect / accept

    /// Bind this endpoint to a filesystem path copied from user memory.
    pub fn bind(
        self: &Arc<Self>,
        process: &Process,
        user_address: UserPtr<SocketAddressUnix>,
        address_size: usize,
    ) -> KResult<()> {
        assert_eq!(self.setup_state(), SetupState::Unstarted);
        if address_size != size_of::<SocketAddressUnix>() {
            return Err(KernelError::InvalidArgument);
        }

        let address: SocketAddressUnix = user_address.read()?;
        if address.family != AF_LOCAL {
            return Err(KernelError::InvalidArgument);
        }
        let path = address.path_str()?;

        log::debug!("LocalSocket bind({path})");

        let (mode, owner) = {
            let inner = self.inner.lock();
            (
                Mode::SOCKET.union(inner.prebind_mode.permissions()),
                Owner {
                    uid: inner.prebind_uid,
                    gid: inner.prebind_gid,
                },
            )
        };
        let flags = OpenFlags::CREATE
            .union(OpenFlags::EXCLUSIVE)
            .union(OpenFlags::NO_FOLLOW);
        let file = match fs::the().open(path, flags, mode, process.cwd(), Some(owner)) {
            Ok(file) => file,
            Err(KernelError::AlreadyExists) => return Err(KernelError::AddressInUse),
            Err(err) => return Err(err),
        };

        let inode = file
            .inode()
            .expect("fs::open returned a description without an inode")
            .clone();
        if !inode.bind_socket(self) {
            return Err(KernelError::AddressInUse);
        }

        let mut inner = self.inner.lock();
        inner.file = Some(file);
        inner.address = address;
        inner.bound = true;
        Ok(())
    }

    /// Start accepting connections; stream sockets only.
    pub fn listen(&self, backlog: usize) -> KResult<()> {
        if self.socket_type != SocketType::Stream {
            return Err(KernelError::NotSupported);
        }
        {
            let mut inner = self.inner.lock();
            inner.backlog = backlog;
            inner.role = Role::Listener;
            inner.connect_side_role = Role::Listener;
        }
        log::debug!("LocalSocket listening with backlog={backlog}");
        self.evaluate_block_conditions();
        Ok(())
    }

    /// Connect this endpoint to the socket bound at the path in user
    /// memory.
    ///
    /// The path is copied into a buffer one byte larger than the address
    /// field, so a non-terminated path from user space stays bounded.
    pub fn connect(
        self: &Arc<Self>,
        process: &Process,
        description: &Arc<FileDescription>,
        user_address: UserPtr<SocketAddressUnix>,
        address_size: usize,
        should_block: ShouldBlock,
    ) -> KResult<()> {
        assert!(!self.inner.lock().bound);
        if address_size != size_of::<SocketAddressUnix>() {
            return Err(KernelError::InvalidArgument);
        }

        let family: u16 = user_address.cast::<u16>().read()?;
        if family != AF_LOCAL {
            return Err(KernelError::InvalidArgument);
        }
        if self.is_connected() {
            return Err(KernelError::AlreadyConnected);
        }

        let mut safe_path = [0u8; SUN_PATH_LEN + 1];
        user_address
            .cast::<u8>()
            .byte_offset(size_of::<u16>())
            .read_bytes(&mut safe_path[..SUN_PATH_LEN])?;
        let path_len = safe_path
            .iter()
            .position(|&byte| byte == 0)
            .expect("oversize path buffer always carries a terminator");
        let path = core::str::from_utf8(&safe_path[..path_len])
            .map_err(|_| KernelError::ConnectionRefused)?;

        log::debug!("LocalSocket connect({path})");

        let file = fs::the()
            .open(path, OpenFlags::READ_WRITE, Mode::NONE, process.cwd(), None)
            .map_err(|_| KernelError::ConnectionRefused)?;
        let inode = file
            .inode()
            .expect("fs::open returned a description without an inode")
            .clone();
        let Some(peer) = inode.socket() else {
            return Err(KernelError::ConnectionRefused);
        };

        {
            let mut inner = self.inner.lock();
            inner.file = Some(file);
            inner.address = SocketAddressUnix::local(path);
            // The syscall layer attaches before connecting, so the
            // calling description must be our connect side.
            assert_eq!(inner.connect_side_fd, Some(description.id()));
            inner.connect_side_role = Role::Connecting;
        }
        self.evaluate_block_conditions();

        if let Err(err) = peer.queue_connection_from(self, process) {
            self.set_connect_side_role(Role::None);
            return Err(err);
        }

        if self.is_connected() {
            // The acceptor raced ahead of us; no need to wait.
            self.set_connect_side_role(Role::Connected);
            return Ok(());
        }

        if should_block == ShouldBlock::No {
            // Queued; the handshake completes when the listener accepts.
            return Err(KernelError::TryAgain);
        }

        let flags = match self.block_on(description, BlockFlags::CONNECT) {
            Ok(flags) => flags,
            Err(err) => {
                self.set_connect_side_role(Role::None);
                return Err(err);
            }
        };

        log::debug!(
            "LocalSocket connect({path}) woken, setup state is {}",
            self.setup_state().name()
        );

        if !flags.contains(BlockFlags::CONNECT) {
            self.set_connect_side_role(Role::None);
            return Err(KernelError::ConnectionRefused);
        }
        self.set_connect_side_role(Role::Connected);
        Ok(())
    }

    /// Queue `peer` as an inbound connection on this (listening) socket,
    /// stamping the connector's credentials.
    ///
    /// Refuses when the pending queue is at the backlog; a socket that
    /// never listened has backlog zero and refuses everything.
    pub fn queue_connection_from(&self, peer: &Arc<LocalSocket>, process: &Process) -> KResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.pending.len() >= inner.backlog {
                return Err(KernelError::ConnectionRefused);
            }
            {
                let mut peer_inner = peer.inner.lock();
                peer_inner.origin = process.credentials();
                peer_inner.setup_state = SetupState::InProgress;
            }
            inner.pending.push_back(peer.clone());
        }
        self.evaluate_block_conditions();
        Ok(())
    }

    /// Whether an `accept` call would succeed immediately.
    #[must_use]
    pub fn can_accept(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    /// Take the oldest pending connection, completing its handshake with
    /// the acceptor's credentials. Returns `None` when nothing is queued.
    pub fn accept(&self, process: &Process) -> Option<Arc<LocalSocket>> {
        let client = self.inner.lock().pending.pop_front()?;
        {
            let mut client_inner = client.inner.lock();
            debug_assert!(!client_inner.connected);
            client_inner.acceptor = process.credentials();
            client_inner.connected = true;
            client_inner.role = Role::Accepted;
            client_inner.setup_state = SetupState::Completed;
        }
        log::debug!(
            "LocalSocket accepted connection from pid {}",
            client.inner.lock().origin.pid
        );
        client.evaluate_block_conditions();
        self.evaluate_block_conditions();
        Some(client)
    }

    // -- Description attachment

    /// Account for a new description referring to this socket. The first
    /// attachment becomes the connect side; any later one opens the
    /// accept side.
    pub(crate) fn attach(&self, description: &FileDescription) -> KResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.connect_side_role == Role::None {
                assert!(inner.connect_side_fd.is_none());
                inner.connect_side_fd = Some(description.id());
            } else {
                assert_ne!(inner.connect_side_fd, Some(description.id()));
                assert!(!inner.accept_side_fd_open);
                inner.accept_side_fd_open = true;
            }
        }
        self.evaluate_block_conditions();
        Ok(())
    }

    /// Account for a description going away, waking peers that were
    /// waiting on it (their reads now return end-of-stream, their writes
    /// fail).
    pub(crate) fn detach(&self, description: &FileDescription) {
        {
            let mut inner = self.inner.lock();
            if inner.connect_side_fd == Some(description.id()) {
                inner.connect_side_fd = None;
            } else {
                assert!(inner.accept_side_fd_open);
                inner.accept_side_fd_open = false;
            }
        }
        self.evaluate_block_conditions();
    }

    /// Whether the other side of the connection still has a description
    /// attached.
    #[must_use]
    pub fn has_attached_peer(&self, description: &FileDescription) -> bool {
        let inner = self.inner.lock();
        let role = inner.role_of(description.id());
        inner.has_attached_peer(role)
    }

    // -- Readiness

    /// A listener is readable when a connection is pending; a connected
    /// side is readable when data is buffered or the peer has detached
    /// (the read completes immediately with end-of-stream).
    #[must_use]
    pub fn can_read(&self, description: &FileDescription) -> bool {
        let inner = self.inner.lock();
        self.can_read_locked(&inner, description.id())
    }

    /// A connected side is writable when its send pipe has space or the
    /// peer has detached (the write completes immediately with an error).
    #[must_use]
    pub fn can_write(&self, description: &FileDescription) -> bool {
        let inner = self.inner.lock();
        self.can_write_locked(&inner, description.id())
    }

    fn can_read_locked(&self, inner: &Inner, description_id: u64) -> bool {
        match inner.role_of(description_id) {
            Role::Listener => !inner.pending.is_empty(),
            Role::Accepted => {
                !inner.has_attached_peer(Role::Accepted) || !self.for_server.is_empty()
            }
            Role::Connected => {
                !inner.has_attached_peer(Role::Connected) || !self.for_client.is_empty()
            }
            _ => false,
        }
    }

    fn can_write_locked(&self, inner: &Inner, description_id: u64) -> bool {
        match inner.role_of(description_id) {
            Role::Accepted => {
                !inner.has_attached_peer(Role::Accepted) || self.for_client.space_for_writing()
            }
            Role::Connected => {
                !inner.has_attached_peer(Role::Connected) || self.for_server.space_for_writing()
            }
            _ => false,
        }
    }

    // -- Stream transfer

    fn send_buffer_for(&self, role: Role) -> &DoubleBuffer {
        match role {
            Role::Connected => &self.for_server,
            Role::Accepted => &self.for_client,
            _ => unreachable!("send buffer for role {}", role.name()),
        }
    }

    fn receive_buffer_for(&self, role: Role) -> &DoubleBuffer {
        match role {
            Role::Connected => &self.for_client,
            Role::Accepted => &self.for_server,
            _ => unreachable!("receive buffer for role {}", role.name()),
        }
    }

    /// Write up to `data_size` bytes into the peer-bound pipe. Partial
    /// writes are normal; a full pipe blocks (blocking descriptions)
    /// until the peer reads or detaches.
    pub fn sendto(
        &self,
        description: &FileDescription,
        data: &InputBuffer<'_>,
        data_size: usize,
    ) -> KResult<usize> {
        loop {
            let (role, peer_attached) = {
                let inner = self.inner.lock();
                let role = inner.role_of(description.id());
                match role {
                    Role::Connected | Role::Accepted => (role, inner.has_attached_peer(role)),
                    _ => return Err(KernelError::NotConnected),
                }
            };
            if !peer_attached {
                return Err(KernelError::BrokenPipe);
            }

            let nwritten = self.send_buffer_for(role).write(data, data_size)?;
            if nwritten > 0 || data_size == 0 {
                return Ok(nwritten);
            }

            // Pipe is full.
            if !description.is_blocking() {
                return Err(KernelError::TryAgain);
            }
            self.block_on(description, BlockFlags::WRITE)?;
        }
    }

    /// Read up to `buffer_size` bytes from the pipe the peer writes into.
    ///
    /// Blocking descriptions wait for data; once the peer has detached,
    /// reads drain whatever is buffered and then return zero.
    pub fn recvfrom(
        &self,
        description: &FileDescription,
        buffer: &mut OutputBuffer<'_>,
        buffer_size: usize,
    ) -> KResult<usize> {
        let role = self.role(description);
        let socket_buffer = match role {
            Role::Connected | Role::Accepted => self.receive_buffer_for(role),
            _ => return Err(KernelError::InvalidArgument),
        };

        if !description.is_blocking() {
            if socket_buffer.is_empty() {
                if !self.has_attached_peer(description) {
                    return Ok(0);
                }
                return Err(KernelError::TryAgain);
            }
        } else if !self.can_read(description) {
            self.block_on(description, BlockFlags::READ)?;
        }

        if !self.has_attached_peer(description) && socket_buffer.is_empty() {
            return Ok(0);
        }
        debug_assert!(!socket_buffer.is_empty());
        socket_buffer.read(buffer, buffer_size)
    }

    // -- Socket options

    /// `SO_PEERCRED`: report the credentials captured when the
    /// connection was established, as seen from `description`'s side.
    pub fn getsockopt(
        &self,
        description: &FileDescription,
        level: i32,
        option: i32,
        value: UserPtrMut<Credentials>,
        value_size: UserPtrMut<u32>,
    ) -> KResult<()> {
        if level != SOL_SOCKET || option != SO_PEERCRED {
            return Err(KernelError::NotSupported);
        }

        let size: u32 = value_size.read()?;
        if (size as usize) < size_of::<Credentials>() {
            return Err(KernelError::InvalidArgument);
        }

        let credentials = {
            let inner = self.inner.lock();
            match inner.role_of(description.id()) {
                Role::Accepted => inner.origin,
                Role::Connected => inner.acceptor,
                Role::Connecting => return Err(KernelError::NotConnected),
                _ => return Err(KernelError::InvalidArgument),
            }
        };

        value.write(&credentials)?;
        value_size.write(&(size_of::<Credentials>() as u32))?;
        Ok(())
    }

    // -- Filesystem metadata

    /// Change permission bits: on the backing file once bound, otherwise
    /// on the pre-bind mode applied at bind time.
    pub fn chmod(&self, mode: Mode) -> KResult<()> {
        let file = self.inner.lock().file.clone();
        if let Some(file) = file {
            return file.chmod(mode);
        }
        self.inner.lock().prebind_mode = mode.permissions();
        Ok(())
    }

    /// Change ownership: on the backing file once bound, otherwise on the
    /// pre-bind owner. Non-superusers may only give the node to
    /// themselves and a group they belong to.
    pub fn chown(&self, process: &Process, uid: u32, gid: u32) -> KResult<()> {
        let file = self.inner.lock().file.clone();
        if let Some(file) = file {
            return file.chown(process, uid, gid);
        }
        if !process.is_superuser() && (process.euid() != uid || !process.in_group(gid)) {
            return Err(KernelError::PermissionDenied);
        }
        let mut inner = self.inner.lock();
        inner.prebind_uid = uid;
        inner.prebind_gid = gid;
        Ok(())
    }

    // -- Description passing

    /// Queue an open description for the peer to receive.
    pub fn sendfd(
        &self,
        socket_description: &FileDescription,
        passing_description: Arc<FileDescription>,
    ) -> KResult<()> {
        let mut inner = self.inner.lock();
        let queue = match inner.role_of(socket_description.id()) {
            Role::Connected => &mut inner.fds_for_server,
            Role::Accepted => &mut inner.fds_for_client,
            _ => return Err(KernelError::InvalidArgument),
        };
        if queue.len() >= MAX_QUEUED_DESCRIPTIONS {
            return Err(KernelError::Busy);
        }
        queue.push_back(passing_description);
        Ok(())
    }

    /// Take the oldest description the peer queued for us.
    pub fn recvfd(&self, socket_description: &FileDescription) -> KResult<Arc<FileDescription>> {
        let mut inner = self.inner.lock();
        let queue = match inner.role_of(socket_description.id()) {
            Role::Connected => &mut inner.fds_for_client,
            Role::Accepted => &mut inner.fds_for_server,
            _ => return Err(KernelError::InvalidArgument),
        };
        queue.pop_front().ok_or(KernelError::TryAgain)
    }

    // -- Blocking machinery

    fn set_connect_side_role(&self, role: Role) {
        self.inner.lock().connect_side_role = role;
        self.evaluate_block_conditions();
    }

    /// Re-check every parked waiter against the current state and wake
    /// the ones whose condition fired. Runs after any transition that can
    /// change readiness; the byte pipes call in from their unblock hooks.
    fn evaluate_block_conditions(&self) {
        let mut to_wake: Vec<(Arc<Blocker>, BlockFlags)> = Vec::new();
        {
            let inner = self.inner.lock();
            let mut blockers = self.blockers.lock();
            blockers.retain(|entry| {
                let mut ready = BlockFlags::NONE;
                let mut handshake_failed = false;
                match inner.role_of(entry.description) {
                    Role::Listener | Role::Accepted | Role::Connected => {
                        if self.can_read_locked(&inner, entry.description) {
                            ready = ready.union(BlockFlags::READ);
                        }
                        if self.can_write_locked(&inner, entry.description) {
                            ready = ready.union(BlockFlags::WRITE);
                        }
                    }
                    Role::Connecting => {
                        if inner.setup_state == SetupState::Completed {
                            if inner.connected {
                                ready = ready.union(BlockFlags::CONNECT);
                            } else {
                                // Wake without the connect flag; the
                                // caller reports the refusal.
                                handshake_failed = true;
                            }
                        }
                    }
                    Role::None => {}
                }
                let fired = ready.intersect(entry.wanted);
                if !fired.is_empty() || handshake_failed {
                    to_wake.push((entry.blocker.clone(), fired));
                    false
                } else {
                    true
                }
            });
        }
        for (blocker, flags) in to_wake {
            blocker.unblock(flags);
        }
    }

    /// Park the calling thread on `description` until one of `wanted`
    /// fires or the thread is interrupted.
    fn block_on(&self, description: &FileDescription, wanted: BlockFlags) -> KResult<BlockFlags> {
        let blocker = Arc::new(Blocker::new());
        if !description.begin_block(&blocker) {
            return Err(KernelError::Interrupted);
        }
        self.blockers.lock().push(BlockerEntry {
            description: description.id(),
            wanted,
            blocker: blocker.clone(),
        });
        // Close the gap between the caller's condition check and
        // registration.
        self.evaluate_block_conditions();

        let result = blocker.wait();
        description.end_block();
        self.blockers
            .lock()
            .retain(|entry| !Arc::ptr_eq(&entry.blocker, &blocker));

        match result {
            BlockResult::Woken(flags) => Ok(flags),
            BlockResult::Interrupted => Err(KernelError::Interrupted),
        }
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        // Our own weak entry is dead by now; sweep it (and any other
        // stragglers) out of the registry.
        all_sockets().write().retain(|weak| weak.upgrade().is_some());
    }
}

impl core::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalSocket")
            .field("type", &self.socket_type)
            .field("path", &String::from_utf8_lossy(inner.address.path_bytes()).to_string())
            .field("role", &inner.role)
            .field("connected", &inner.connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{mock, Filesystem};
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    const ADDR_SIZE: usize = size_of::<SocketAddressUnix>();

    fn unique_path(tag: &str) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("/sock/{tag}-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn addr_ptr(address: &SocketAddressUnix) -> UserPtr<SocketAddressUnix> {
        UserPtr::from_addr(address as *const SocketAddressUnix as usize)
    }

    fn server_process() -> Process {
        Process::new(100, 500, 500)
    }

    fn client_process() -> Process {
        Process::new(200, 600, 600)
    }

    fn bind_listener(
        path: &str,
        process: &Process,
        backlog: usize,
    ) -> (Arc<LocalSocket>, Arc<FileDescription>) {
        mock::install_test_fs();
        let socket = LocalSocket::create(SocketType::Stream, process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(path);
        socket.bind(process, addr_ptr(&address), ADDR_SIZE).unwrap();
        socket.listen(backlog).unwrap();
        (socket, description)
    }

    /// Full handshake over two threads. Returns the connection socket
    /// (one object, both sides) with the connect-side and accept-side
    /// descriptions.
    fn establish(path: &str) -> (Arc<LocalSocket>, Arc<FileDescription>, Arc<FileDescription>) {
        let server = server_process();
        let client = client_process();
        let (listener, _listener_desc) = bind_listener(path, &server, 4);

        let connecting = LocalSocket::create(SocketType::Stream, &client);
        let connect_desc = FileDescription::open_socket(connecting.clone()).unwrap();

        let address = SocketAddressUnix::local(path);
        let address_addr = &address as *const SocketAddressUnix as usize;
        let thread_socket = connecting.clone();
        let thread_desc = connect_desc.clone();
        let connector = thread::spawn(move || {
            thread_socket.connect(
                &client,
                &thread_desc,
                UserPtr::from_addr(address_addr),
                ADDR_SIZE,
                ShouldBlock::Yes,
            )
        });

        let accepted = loop {
            if let Some(accepted) = listener.accept(&server) {
                break accepted;
            }
            thread::yield_now();
        };
        let accept_desc = FileDescription::open_socket(accepted.clone()).unwrap();
        connector.join().unwrap().unwrap();

        assert!(Arc::ptr_eq(&accepted, &connecting));
        (accepted, connect_desc, accept_desc)
    }

    fn send_all(
        socket: &LocalSocket,
        description: &FileDescription,
        mut data: &[u8],
    ) -> KResult<()> {
        while !data.is_empty() {
            let n = socket.sendto(description, &InputBuffer::Kernel(data), data.len())?;
            data = &data[n..];
        }
        Ok(())
    }

    fn recv_some(
        socket: &LocalSocket,
        description: &FileDescription,
        max: usize,
    ) -> KResult<Vec<u8>> {
        let mut storage = alloc::vec![0u8; max];
        let n = socket.recvfrom(description, &mut OutputBuffer::Kernel(&mut storage), max)?;
        storage.truncate(n);
        Ok(storage)
    }

    // -- bind / listen

    #[test]
    fn test_bind_creates_socket_node() {
        let filesystem = mock::install_test_fs();
        let process = server_process();
        let path = unique_path("bind");
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let _description = FileDescription::open_socket(socket.clone()).unwrap();

        let address = SocketAddressUnix::local(&path);
        socket.bind(&process, addr_ptr(&address), ADDR_SIZE).unwrap();
        assert!(filesystem.contains(&path));
        assert_eq!(socket.socket_path(), path);

        let node = fs::the()
            .open(&path, OpenFlags::READ_WRITE, Mode::NONE, "/", None)
            .unwrap();
        let inode = node.inode().unwrap();
        assert!(inode.mode().is_socket());
        assert_eq!(inode.mode().permissions(), Mode::new(0o666));
        assert_eq!(inode.owner().uid, process.euid());
    }

    #[test]
    fn test_bind_collision_is_address_in_use() {
        let process = server_process();
        let path = unique_path("collide");
        let (_listener, _desc) = bind_listener(&path, &process, 1);

        let second = LocalSocket::create(SocketType::Stream, &process);
        let _second_desc = FileDescription::open_socket(second.clone()).unwrap();
        let address = SocketAddressUnix::local(&path);
        assert_eq!(
            second.bind(&process, addr_ptr(&address), ADDR_SIZE),
            Err(KernelError::AddressInUse)
        );
    }

    #[test]
    fn test_bind_validates_arguments() {
        mock::install_test_fs();
        let process = server_process();
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let _description = FileDescription::open_socket(socket.clone()).unwrap();

        let address = SocketAddressUnix::local(&unique_path("args"));
        assert_eq!(
            socket.bind(&process, addr_ptr(&address), ADDR_SIZE - 1),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            socket.bind(&process, UserPtr::from_addr(0), ADDR_SIZE),
            Err(KernelError::BadAddress)
        );

        let mut wrong_family = address;
        wrong_family.family = 2;
        assert_eq!(
            socket.bind(&process, addr_ptr(&wrong_family), ADDR_SIZE),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_listen_requires_stream() {
        mock::install_test_fs();
        let process = server_process();
        let socket = LocalSocket::create(SocketType::Datagram, &process);
        assert_eq!(socket.listen(4), Err(KernelError::NotSupported));
    }

    // -- connect

    #[test]
    fn test_connect_refusal_paths() {
        let filesystem = mock::install_test_fs();
        let process = client_process();

        // Target path does not exist.
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(&unique_path("missing"));
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::Yes),
            Err(KernelError::ConnectionRefused)
        );

        // Target exists but is not a socket.
        let plain = unique_path("plain-file");
        filesystem
            .open(&plain, OpenFlags::CREATE, Mode::NONE, "/", None)
            .unwrap();
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(&plain);
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::Yes),
            Err(KernelError::ConnectionRefused)
        );
        assert_eq!(socket.role(&description), Role::None);

        // Listener with a saturated backlog refuses.
        let path = unique_path("no-backlog");
        let (_listener, _ldesc) = bind_listener(&path, &server_process(), 0);
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(&path);
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::Yes),
            Err(KernelError::ConnectionRefused)
        );
        assert_eq!(socket.role(&description), Role::None);
    }

    #[test]
    fn test_connect_validates_family() {
        mock::install_test_fs();
        let process = client_process();
        let socket = LocalSocket::create(SocketType::Stream, &process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let mut address = SocketAddressUnix::local("/sock/nowhere");
        address.family = 7;
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::Yes),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_nonblocking_connect_stays_queued() {
        let process = client_process();
        let path = unique_path("nb-connect");
        let (listener, _listener_desc) = bind_listener(&path, &server_process(), 4);

        let socket = LocalSocket::create(SocketType::Stream, &process);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(&path);
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::No),
            Err(KernelError::TryAgain)
        );
        assert_eq!(socket.role(&description), Role::Connecting);
        assert_eq!(socket.setup_state(), SetupState::InProgress);

        // Peercred is not available mid-handshake.
        let mut credentials = Credentials::default();
        let mut size = size_of::<Credentials>() as u32;
        assert_eq!(
            socket.getsockopt(
                &description,
                SOL_SOCKET,
                SO_PEERCRED,
                UserPtrMut::from_addr(&mut credentials as *mut Credentials as usize),
                UserPtrMut::from_addr(&mut size as *mut u32 as usize),
            ),
            Err(KernelError::NotConnected)
        );

        // The acceptor completes the handshake behind our back.
        let accepted = listener.accept(&server_process()).unwrap();
        assert!(Arc::ptr_eq(&accepted, &socket));
        assert!(socket.is_connected());

        // A second connect on a connected endpoint is rejected.
        assert_eq!(
            socket.connect(&process, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::No),
            Err(KernelError::AlreadyConnected)
        );
    }

    // -- stream transfer

    #[test]
    fn test_stream_send_receive() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("stream"));

        let sent = socket
            .sendto(&connect_desc, &InputBuffer::Kernel(b"hello"), 5)
            .unwrap();
        assert_eq!(sent, 5);
        assert_eq!(recv_some(&socket, &accept_desc, 10).unwrap(), b"hello");

        // And the reverse direction through the other pipe.
        socket
            .sendto(&accept_desc, &InputBuffer::Kernel(b"welcome"), 7)
            .unwrap();
        assert_eq!(recv_some(&socket, &connect_desc, 32).unwrap(), b"welcome");
    }

    #[test]
    fn test_nonblocking_recv_try_again() {
        let (socket, _connect_desc, accept_desc) = establish(&unique_path("nb-recv"));
        accept_desc.set_blocking(false);
        assert_eq!(
            recv_some(&socket, &accept_desc, 16),
            Err(KernelError::TryAgain)
        );
    }

    #[test]
    fn test_blocking_recv_waits_for_data() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("blk-recv"));

        let reader_socket = socket.clone();
        let reader_desc = accept_desc.clone();
        let reader = thread::spawn(move || recv_some(&reader_socket, &reader_desc, 16));

        socket
            .sendto(&connect_desc, &InputBuffer::Kernel(b"ping"), 4)
            .unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), b"ping");
    }

    #[test]
    fn test_interrupted_recv() {
        let (socket, _connect_desc, accept_desc) = establish(&unique_path("intr"));

        let reader_socket = socket.clone();
        let reader_desc = accept_desc.clone();
        let reader = thread::spawn(move || recv_some(&reader_socket, &reader_desc, 16));

        // Delivered as pending if the reader has not parked yet.
        accept_desc.interrupt();
        assert_eq!(reader.join().unwrap(), Err(KernelError::Interrupted));
    }

    #[test]
    fn test_peer_detach_gives_eof_then_broken_pipe() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("detach"));

        socket
            .sendto(&connect_desc, &InputBuffer::Kernel(b"bye"), 3)
            .unwrap();
        drop(connect_desc);

        // Buffered bytes drain first, then end-of-stream.
        assert_eq!(recv_some(&socket, &accept_desc, 16).unwrap(), b"bye");
        assert_eq!(recv_some(&socket, &accept_desc, 16).unwrap(), b"");
        assert!(socket.can_read(&accept_desc));
        assert!(socket.can_write(&accept_desc));

        assert_eq!(
            socket.sendto(&accept_desc, &InputBuffer::Kernel(b"x"), 1),
            Err(KernelError::BrokenPipe)
        );
    }

    #[test]
    fn test_backpressure_blocks_and_unblocks() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("backpressure"));

        // Fill the pipe: the first oversized write is cut short.
        let big = alloc::vec![0x5au8; DEFAULT_CAPACITY + 1];
        let written = socket
            .sendto(&connect_desc, &InputBuffer::Kernel(&big), big.len())
            .unwrap();
        assert_eq!(written, DEFAULT_CAPACITY);
        assert!(!socket.can_write(&connect_desc));

        // Non-blocking writers are told to come back.
        connect_desc.set_blocking(false);
        assert_eq!(
            socket.sendto(&connect_desc, &InputBuffer::Kernel(b"x"), 1),
            Err(KernelError::TryAgain)
        );
        connect_desc.set_blocking(true);

        // A blocking writer parks until the reader frees space.
        let writer_socket = socket.clone();
        let writer_desc = connect_desc.clone();
        let writer = thread::spawn(move || {
            writer_socket.sendto(&writer_desc, &InputBuffer::Kernel(b"tail"), 4)
        });

        let mut drained = 0;
        while drained < DEFAULT_CAPACITY {
            drained += recv_some(&socket, &accept_desc, 4096).unwrap().len();
        }
        assert!(writer.join().unwrap().unwrap() > 0);
    }

    #[test]
    fn test_fifo_ordering_under_concurrency() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("fifo"));

        let total = 3 * DEFAULT_CAPACITY + 517;
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let writer_socket = socket.clone();
        let writer_desc = connect_desc.clone();
        let writer_payload = payload.clone();
        let writer =
            thread::spawn(move || send_all(&writer_socket, &writer_desc, &writer_payload));

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            let chunk = recv_some(&socket, &accept_desc, 4096).unwrap();
            received.extend_from_slice(&chunk);
        }
        writer.join().unwrap().unwrap();
        assert_eq!(received, payload);
    }

    // -- peer credentials

    #[test]
    fn test_peercred_round_trip() {
        let (socket, connect_desc, accept_desc) = establish(&unique_path("peercred"));

        let mut credentials = Credentials::default();
        let mut size = size_of::<Credentials>() as u32 + 4;
        socket
            .getsockopt(
                &accept_desc,
                SOL_SOCKET,
                SO_PEERCRED,
                UserPtrMut::from_addr(&mut credentials as *mut Credentials as usize),
                UserPtrMut::from_addr(&mut size as *mut u32 as usize),
            )
            .unwrap();
        assert_eq!(credentials, client_process().credentials());
        assert_eq!(size as usize, size_of::<Credentials>());

        socket
            .getsockopt(
                &connect_desc,
                SOL_SOCKET,
                SO_PEERCRED,
                UserPtrMut::from_addr(&mut credentials as *mut Credentials as usize),
                UserPtrMut::from_addr(&mut size as *mut u32 as usize),
            )
            .unwrap();
        assert_eq!(credentials, server_process().credentials());
    }

    #[test]
    fn test_peercred_rejects_short_buffer() {
        let (socket, _connect_desc, accept_desc) = establish(&unique_path("peercred-short"));
        let mut credentials = Credentials::default();
        let mut size = size_of::<Credentials>() as u32 - 1;
        assert_eq!(
            socket.getsockopt(
                &accept_desc,
                SOL_SOCKET,
                SO_PEERCRED,
                UserPtrMut::from_addr(&mut credentials as *mut Credentials as usize),
                UserPtrMut::from_addr(&mut size as *mut u32 as usize),
            ),
            Err(KernelError::InvalidArgument)
        );
    }

    // -- description passing

    #[test]
    fn test_fd_passing_fifo_and_saturation() {
        let filesystem = mock::install_test_fs();
        let (socket, connect_desc, accept_desc) = establish(&unique_path("fdpass"));

        let mut passed = Vec::new();
        for _ in 0..MAX_QUEUED_DESCRIPTIONS {
            let node = filesystem
                .open(
                    &unique_path("passed-node"),
                    OpenFlags::CREATE,
                    Mode::NONE,
                    "/",
                    None,
                )
                .unwrap();
            socket.sendfd(&connect_desc, node.clone()).unwrap();
            passed.push(node);
        }

        // The seventeenth is refused.
        let overflow = filesystem
            .open(&unique_path("overflow"), OpenFlags::CREATE, Mode::NONE, "/", None)
            .unwrap();
        assert_eq!(
            socket.sendfd(&connect_desc, overflow),
            Err(KernelError::Busy)
        );

        // Received in order, referring to the same underlying nodes.
        for sent in &passed {
            let received = socket.recvfd(&accept_desc).unwrap();
            assert!(Arc::ptr_eq(
                received.inode().unwrap(),
                sent.inode().unwrap()
            ));
        }
        assert_eq!(
            socket.recvfd(&accept_desc).map(|_| ()),
            Err(KernelError::TryAgain)
        );
    }

    #[test]
    fn test_fd_passing_requires_connection() {
        let process = server_process();
        let path = unique_path("fd-role");
        let (listener, listener_desc) = bind_listener(&path, &process, 1);
        let node = mock::install_test_fs()
            .open(&unique_path("node"), OpenFlags::CREATE, Mode::NONE, "/", None)
            .unwrap();
        assert_eq!(
            listener.sendfd(&listener_desc, node),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            listener.recvfd(&listener_desc).map(|_| ()),
            Err(KernelError::InvalidArgument)
        );
    }

    // -- metadata

    #[test]
    fn test_chmod_chown_prebind_and_delegation() {
        let filesystem = mock::install_test_fs();
        let root = Process::new(1, 0, 0);
        let user = Process::new(300, 700, 700);

        let socket = LocalSocket::create(SocketType::Stream, &user);
        let _description = FileDescription::open_socket(socket.clone()).unwrap();

        // Pre-bind: mode and owner are staged for bind.
        socket.chmod(Mode::new(0o700)).unwrap();
        assert_eq!(
            socket.chown(&user, 0, 0),
            Err(KernelError::PermissionDenied)
        );
        socket.chown(&root, 55, 66).unwrap();

        let path = unique_path("meta");
        let address = SocketAddressUnix::local(&path);
        socket.bind(&root, addr_ptr(&address), ADDR_SIZE).unwrap();

        let node = filesystem
            .open(&path, OpenFlags::READ_WRITE, Mode::NONE, "/", None)
            .unwrap();
        let inode = node.inode().unwrap();
        assert!(inode.mode().is_socket());
        assert_eq!(inode.mode().permissions(), Mode::new(0o700));
        assert_eq!(inode.owner().uid, 55);
        assert_eq!(inode.owner().gid, 66);

        // Post-bind: both delegate to the backing file.
        socket.chmod(Mode::new(0o640)).unwrap();
        assert_eq!(inode.mode().permissions(), Mode::new(0o640));
        socket.chown(&root, 5, 6).unwrap();
        assert_eq!(inode.owner().uid, 5);
    }

    #[test]
    fn test_chown_allows_own_identity() {
        mock::install_test_fs();
        let user = Process::new(300, 700, 700).with_groups(alloc::vec![800]);
        let socket = LocalSocket::create(SocketType::Stream, &user);
        socket.chown(&user, 700, 800).unwrap();
        assert_eq!(
            socket.chown(&user, 700, 999),
            Err(KernelError::PermissionDenied)
        );
    }

    // -- readiness and diagnostics

    #[test]
    fn test_listener_readable_when_pending() {
        let process = server_process();
        let path = unique_path("readable");
        let (listener, listener_desc) = bind_listener(&path, &process, 2);
        assert!(!listener.can_read(&listener_desc));
        assert!(!listener.can_accept());

        let client = client_process();
        let socket = LocalSocket::create(SocketType::Stream, &client);
        let description = FileDescription::open_socket(socket.clone()).unwrap();
        let address = SocketAddressUnix::local(&path);
        assert_eq!(
            socket.connect(&client, &description, addr_ptr(&address), ADDR_SIZE, ShouldBlock::No),
            Err(KernelError::TryAgain)
        );

        assert!(listener.can_accept());
        assert!(listener.can_read(&listener_desc));
        listener.accept(&process).unwrap();
        assert!(!listener.can_read(&listener_desc));
    }

    #[test]
    fn test_absolute_path_reflects_role() {
        let path = unique_path("diag");
        let (listener, listener_desc) = bind_listener(&path, &server_process(), 4);
        assert_eq!(
            listener.absolute_path(&listener_desc),
            format!("socket:{path} (listening)")
        );

        let (socket, connect_desc, accept_desc) = establish(&unique_path("diag2"));
        assert!(socket
            .absolute_path(&connect_desc)
            .contains("(connected to pid 100)"));
        assert!(socket
            .absolute_path(&accept_desc)
            .contains("(accepted from pid 200)"));
    }

    #[test]
    fn test_registry_tracks_live_sockets() {
        mock::install_test_fs();
        let process = server_process();
        let first = LocalSocket::create(SocketType::Stream, &process);
        let second = LocalSocket::create(SocketType::Datagram, &process);

        let count_mine = |targets: &[&Arc<LocalSocket>]| {
            let mut seen = 0;
            for_each(|socket| {
                if targets.iter().any(|target| Arc::ptr_eq(socket, target)) {
                    seen += 1;
                }
            });
            seen
        };

        assert_eq!(count_mine(&[&first, &second]), 2);
        drop(second);
        assert_eq!(count_mine(&[&first]), 1);
    }
}
