//! Bounded byte pipe
//!
//! One direction of a socket: a capacity-limited byte queue with a read
//! half and a write half. Readers drain the read half; when it runs dry
//! the halves are swapped, so writers never contend with a reader mid-copy.
//!
//! The unblock callback fires on the two transitions blocked threads care
//! about: empty to non-empty (readers) and full to has-space (writers).
//! It is invoked after the internal lock is released, so the callback may
//! re-enter socket state, but it must not call back into this buffer.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::KResult;
use crate::usercopy::{InputBuffer, OutputBuffer};

/// Capacity of one pipe direction in bytes.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

type UnblockCallback = Box<dyn Fn() + Send + Sync>;

struct Halves {
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
}

impl Halves {
    fn is_empty(&self) -> bool {
        self.read_pos == self.read_buf.len() && self.write_buf.is_empty()
    }

    fn unread(&self) -> usize {
        (self.read_buf.len() - self.read_pos) + self.write_buf.len()
    }
}

/// A bounded byte pipe with blocking-condition hooks.
pub struct DoubleBuffer {
    capacity: usize,
    halves: Mutex<Halves>,
    unblock_callback: Mutex<Option<UnblockCallback>>,
}

impl DoubleBuffer {
    /// Create a pipe bounded at `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            halves: Mutex::new(Halves {
                read_buf: Vec::new(),
                read_pos: 0,
                write_buf: Vec::new(),
            }),
            unblock_callback: Mutex::new(None),
        }
    }

    /// Install the hook invoked on empty-to-non-empty and
    /// full-to-has-space transitions.
    pub fn set_unblock_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.unblock_callback.lock() = Some(Box::new(callback));
    }

    /// Check if there is nothing buffered in either half.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.halves.lock().is_empty()
    }

    /// Number of buffered bytes across both halves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.halves.lock().unread()
    }

    /// Check if a writer could make progress right now.
    #[must_use]
    pub fn space_for_writing(&self) -> bool {
        self.halves.lock().write_buf.len() < self.capacity
    }

    /// Append up to `size` bytes from `data`, bounded by the remaining
    /// capacity of the write half. Returns the number of bytes accepted;
    /// zero means the pipe is full.
    pub fn write(&self, data: &InputBuffer<'_>, size: usize) -> KResult<usize> {
        let became_nonempty;
        let nwritten;
        {
            let mut halves = self.halves.lock();
            let was_empty = halves.is_empty();
            let space = self.capacity - halves.write_buf.len();
            nwritten = size.min(space).min(data.len());
            if nwritten == 0 {
                return Ok(0);
            }
            let old_len = halves.write_buf.len();
            halves.write_buf.resize(old_len + nwritten, 0);
            if let Err(err) = data.read(0, &mut halves.write_buf[old_len..]) {
                halves.write_buf.truncate(old_len);
                return Err(err);
            }
            became_nonempty = was_empty;
        }
        if became_nonempty {
            self.fire_unblock();
        }
        Ok(nwritten)
    }

    /// Move up to `size` bytes into `out`, bounded by what is buffered.
    /// Returns the number of bytes delivered; zero means the pipe is
    /// empty.
    pub fn read(&self, out: &mut OutputBuffer<'_>, size: usize) -> KResult<usize> {
        let freed_space;
        let nread;
        {
            let mut halves = self.halves.lock();
            let was_full = halves.write_buf.len() == self.capacity;
            if halves.read_pos == halves.read_buf.len() && !halves.write_buf.is_empty() {
                // Read half exhausted: swap in the write half, reusing the
                // drained allocation for future writes.
                halves.read_buf.clear();
                halves.read_pos = 0;
                let halves = &mut *halves;
                core::mem::swap(&mut halves.read_buf, &mut halves.write_buf);
            }
            let available = halves.read_buf.len() - halves.read_pos;
            nread = size.min(available).min(out.len());
            if nread == 0 {
                return Ok(0);
            }
            let start = halves.read_pos;
            out.write(0, &halves.read_buf[start..start + nread])?;
            halves.read_pos += nread;
            freed_space = was_full && halves.write_buf.len() < self.capacity;
        }
        if freed_space {
            self.fire_unblock();
        }
        Ok(nread)
    }

    fn fire_unblock(&self) {
        // Take a shared look at the hook without holding the data lock;
        // the hook re-enters socket state.
        let callback = self.unblock_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback();
        }
    }
}
