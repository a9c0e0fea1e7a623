//! # krait-common
//!
//! Shared types and constants for the krait kernel crates.
//!
//! This crate defines the virtual-address vocabulary used by the memory
//! subsystem and the socket layer:
//! - [`VirtAddr`](addr::VirtAddr): page-aligned virtual address newtype
//! - [`PAGE_SIZE`](addr::PAGE_SIZE): the architectural page granule
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it suitable
//! as a foundation crate that all other krait crates can depend on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;

// Re-export commonly used types
pub use addr::{VirtAddr, PAGE_SIZE};
