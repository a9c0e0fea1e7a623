//! Local-domain sockets
//!
//! Filesystem-backed, bidirectional byte channels between two processes
//! on the same machine, with peer-credential propagation and passing of
//! open file descriptions.

pub mod address;
pub mod local_socket;
pub mod socket;

pub use address::{SocketAddressUnix, AF_LOCAL};
pub use local_socket::LocalSocket;
pub use socket::{Role, SetupState, ShouldBlock, SocketType};
