//! Thread suspension on file-description conditions
//!
//! A [`Blocker`] is a one-shot rendezvous between a thread that has
//! nothing to do (empty receive buffer, full send buffer, handshake in
//! flight) and the state transition that gives it something to do. The
//! waking side publishes which conditions fired as [`BlockFlags`]; the
//! scheduler signals cancellation through [`Blocker::interrupt`].
//!
//! Suspension here is a spin-wait. A real scheduler parks the thread off
//! the run queue instead; the wake/interrupt protocol is identical either
//! way, which is what the socket layer depends on.

use core::sync::atomic::{AtomicU32, Ordering};

/// Conditions a blocked thread can wait for.
///
/// # Layout
///
/// Flags are packed into a single byte:
/// - Bit 0: Read (data or a pending connection is available)
/// - Bit 1: Write (the send buffer has space)
/// - Bit 2: Connect (the handshake completed)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct BlockFlags(u8);

impl BlockFlags {
    /// No conditions.
    pub const NONE: Self = Self(0);

    /// Data (or a pending connection) is available for reading.
    pub const READ: Self = Self(1 << 0);

    /// The send buffer has space for writing.
    pub const WRITE: Self = Self(1 << 1);

    /// The connection handshake completed.
    pub const CONNECT: Self = Self(1 << 2);

    /// Create flags from raw bits, masking reserved bits off.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check if no condition is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if all conditions in `other` are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Conditions present in both operands.
    #[inline]
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Conditions present in either operand.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::fmt::Debug for BlockFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::CONNECT, "CONNECT"),
        ];
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Outcome of a [`Blocker::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockResult {
    /// The thread was woken; the flags say which conditions fired. The
    /// flags may be empty when the waker only had a state change to
    /// report (for example a refused handshake).
    Woken(BlockFlags),
    /// The thread was interrupted by the scheduler.
    Interrupted,
}

const WOKEN: u32 = 1 << 8;
const INTERRUPTED: u32 = 1 << 9;

/// A one-shot suspension point.
///
/// Exactly one thread calls [`wait`](Self::wait); any number of threads
/// may call [`unblock`](Self::unblock) or [`interrupt`](Self::interrupt).
/// Interruption wins over a concurrent wake, matching the cancellation
/// rule that an interrupted call must report `Interrupted` regardless of
/// buffer state.
pub struct Blocker {
    state: AtomicU32,
}

impl Blocker {
    /// Create a blocker with no conditions fired.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Wake the blocked thread, reporting the conditions that fired.
    pub fn unblock(&self, flags: BlockFlags) {
        self.state
            .fetch_or(u32::from(flags.bits()) | WOKEN, Ordering::Release);
    }

    /// Cancel the blocked thread.
    pub fn interrupt(&self) {
        self.state.fetch_or(INTERRUPTED, Ordering::Release);
    }

    /// Check whether the blocker is still waiting (neither woken nor
    /// interrupted).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    /// Suspend until woken or interrupted.
    pub fn wait(&self) -> BlockResult {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & INTERRUPTED != 0 {
                return BlockResult::Interrupted;
            }
            if state & WOKEN != 0 {
                return BlockResult::Woken(BlockFlags::from_bits(state as u8));
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for Blocker {
    fn default() -> Self {
        Self::new()
    }
}
