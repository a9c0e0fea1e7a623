//! Socket vocabulary
//!
//! The type, per-description role and setup progression shared by socket
//! endpoints. One socket object can back two open descriptions at once
//! (connector and acceptor); the role is a property of the description,
//! not of the socket.

/// Transport discipline of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    /// Ordered byte stream with connection semantics.
    Stream,
    /// Datagram messages.
    Datagram,
}

/// The function of one open file description referring to a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Role {
    /// Not yet participating in a connection.
    #[default]
    None,
    /// Accepting inbound connections.
    Listener,
    /// The acceptor side of an established connection.
    Accepted,
    /// The connector side, handshake still in flight.
    Connecting,
    /// The connector side of an established connection.
    Connected,
}

impl Role {
    /// Short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Listener => "Listener",
            Self::Accepted => "Accepted",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        }
    }
}

/// Progress of an endpoint through its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SetupState {
    /// Nothing has happened yet.
    #[default]
    Unstarted,
    /// Queued on a listener, waiting to be accepted.
    InProgress,
    /// The handshake finished (successfully or not).
    Completed,
}

impl SetupState {
    /// Short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unstarted => "Unstarted",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
        }
    }
}

/// Whether a connect call may suspend the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShouldBlock {
    /// Fail with `TryAgain` instead of waiting.
    No,
    /// Suspend until the handshake resolves.
    Yes,
}
