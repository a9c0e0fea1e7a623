//! Scheduler seam
//!
//! The only scheduler facility the socket layer needs is a way to suspend
//! the calling thread until a file-description condition fires or the
//! thread is interrupted. [`blocker`] provides that primitive.

pub mod blocker;

pub use blocker::{BlockFlags, BlockResult, Blocker};
