//! # krait-kernel
//!
//! Kernel subsystems for krait: local (intra-host) sockets and the
//! per-address-space virtual range allocator.
//!
//! The two cores are independent:
//! - [`net`] implements the local-domain socket endpoint: a
//!   filesystem-backed, bidirectional byte channel between two processes,
//!   with peer-credential propagation and file-description passing.
//! - [`memory`] implements the ordered free-list allocator that hands out
//!   sub-ranges of one contiguous virtual-address region.
//!
//! External collaborators live behind narrow seams: the filesystem
//! ([`fs::Filesystem`]), the scheduler's suspension primitive
//! ([`sched::Blocker`]), caller identity ([`process::Process`]), and
//! fallible user-memory copies ([`usercopy`]).

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod double_buffer;
pub mod error;
pub mod fs;
pub mod memory;
pub mod net;
pub mod process;
pub mod sched;
pub mod usercopy;

pub use error::{KResult, KernelError};
