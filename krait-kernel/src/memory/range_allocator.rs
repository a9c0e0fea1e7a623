//! Virtual range allocator
//!
//! Manages one contiguous virtual-address region per address space and
//! hands out disjoint sub-ranges from an ordered free list. First-fit
//! with alignment; deallocation re-inserts and coalesces with touching
//! neighbours so the list stays sorted, disjoint and gap-separated.
//!
//! With the `guard-pages` feature (default), anywhere-allocations are
//! placed one page past the start of the chosen slot and sized so that
//! an unmapped page separates consecutive allocations on each side. The
//! guard pages themselves stay on the free list; the offset placement is
//! what keeps neighbouring allocations apart.

use alloc::vec::Vec;

use krait_common::{VirtAddr, PAGE_SIZE};
use spin::Mutex;

use super::range::Range;

struct FreeList {
    total_range: Range,
    available_ranges: Vec<Range>,
}

/// Allocator for one contiguous virtual-address universe.
pub struct RangeAllocator {
    // Spinlock: no operation here ever sleeps.
    state: Mutex<FreeList>,
}

impl RangeAllocator {
    /// Create an allocator with an empty universe. Call one of the
    /// `initialize_*` methods before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(FreeList {
                total_range: Range::new(VirtAddr::NULL, 0),
                available_ranges: Vec::new(),
            }),
        }
    }

    /// Set the universe to `[base, base + size)` with everything free.
    pub fn initialize_with_range(&mut self, base: VirtAddr, size: usize) {
        let state = self.state.get_mut();
        state.total_range = Range::new(base, size);
        state.available_ranges.clear();
        state.available_ranges.push(Range::new(base, size));
    }

    /// Copy the universe and free list of `parent`, for a forked address
    /// space. The parent is locked for the duration of the copy; this
    /// allocator is not yet visible to anyone else.
    pub fn initialize_from_parent(&mut self, parent: &RangeAllocator) {
        let parent_state = parent.state.lock();
        let state = self.state.get_mut();
        state.total_range = parent_state.total_range;
        state.available_ranges = parent_state.available_ranges.clone();
    }

    /// The fixed universe this allocator manages.
    #[must_use]
    pub fn total_range(&self) -> Range {
        self.state.lock().total_range
    }

    /// Log the free list at debug level.
    pub fn dump(&self) {
        let state = self.state.lock();
        log::debug!("RangeAllocator({:?})", state.total_range);
        for range in &state.available_ranges {
            log::debug!(
                "    {:#x} -> {:#x}",
                range.base().as_u64(),
                range.end().as_u64() - 1
            );
        }
    }

    /// Allocate `size` bytes anywhere in the universe, with the base
    /// aligned to `alignment` (a power of two).
    ///
    /// Returns `None` when no free range can hold the request. The fit
    /// check demands `alignment` slack on top of the effective size even
    /// when the candidate's base is already aligned; this passes over
    /// some technically feasible slots in exchange for never having to
    /// re-scan after alignment.
    pub fn allocate_anywhere(&self, size: usize, alignment: usize) -> Option<Range> {
        if size == 0 {
            return None;
        }
        assert!(alignment.is_power_of_two());

        #[cfg(feature = "guard-pages")]
        let (effective_size, offset_from_base) = (size.checked_add(PAGE_SIZE * 2)?, PAGE_SIZE);
        #[cfg(not(feature = "guard-pages"))]
        let (effective_size, offset_from_base) = (size, 0);

        let mut state = self.state.lock();
        for index in 0..state.available_ranges.len() {
            let available_range = state.available_ranges[index];
            if available_range.size() < effective_size.saturating_add(alignment) {
                continue;
            }

            let initial_base = available_range.base().offset(offset_from_base as u64);
            let Some(aligned_base) = initial_base.align_up(alignment as u64) else {
                continue;
            };

            let allocated_range = Range::new(aligned_base, size);
            if available_range == allocated_range {
                state.available_ranges.remove(index);
                return Some(allocated_range);
            }
            carve_at_index(&mut state.available_ranges, index, allocated_range);
            log::trace!(
                "RangeAllocator: allocate_anywhere({:#x}, {:#x}) -> {:?}",
                size,
                alignment,
                allocated_range
            );
            return Some(allocated_range);
        }
        log::warn!(
            "RangeAllocator: failed to allocate anywhere: size={:#x} alignment={:#x}",
            size,
            alignment
        );
        None
    }

    /// Allocate exactly `[base, base + size)` if it is fully free.
    pub fn allocate_specific(&self, base: VirtAddr, size: usize) -> Option<Range> {
        if size == 0 {
            return None;
        }

        let allocated_range = Range::new(base, size);
        let mut state = self.state.lock();
        for index in 0..state.available_ranges.len() {
            let available_range = state.available_ranges[index];
            if !available_range.contains(allocated_range) {
                continue;
            }
            if available_range == allocated_range {
                state.available_ranges.remove(index);
                return Some(allocated_range);
            }
            carve_at_index(&mut state.available_ranges, index, allocated_range);
            return Some(allocated_range);
        }
        log::warn!(
            "RangeAllocator: failed to allocate specific range: {:?}",
            allocated_range
        );
        None
    }

    /// Return a previously allocated range to the free list, merging with
    /// any touching neighbour on either side.
    pub fn deallocate(&self, range: Range) {
        let mut state = self.state.lock();
        assert!(state.total_range.contains(range));
        assert!(range.size() > 0);
        assert!(range.base() < range.end());

        // Free-list ends are strictly increasing, so an ordered search by
        // end locates the neighbour that touches range.base, if any.
        let ranges = &mut state.available_ranges;
        let merged_index = match ranges.binary_search_by(|entry| entry.end().cmp(&range.base())) {
            Ok(index) => {
                // Merge-left: grow the touching predecessor in place.
                ranges[index] = Range::new(ranges[index].base(), ranges[index].size() + range.size());
                index
            }
            Err(index) => {
                // No touching predecessor; Err position keeps base order.
                ranges.insert(index, range);
                index
            }
        };

        // At most one successor can now touch: the invariant held before
        // this insertion.
        if merged_index + 1 < ranges.len() {
            let merged = ranges[merged_index];
            let next = ranges[merged_index + 1];
            if merged.end() == next.base() {
                ranges[merged_index] = Range::new(merged.base(), merged.size() + next.size());
                ranges.remove(merged_index + 1);
            }
        }
    }
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the range at `index` with the residuals left after removing
/// `allocated` from it.
fn carve_at_index(ranges: &mut Vec<Range>, index: usize, allocated: Range) {
    let remaining_parts = ranges[index].carve(allocated);
    assert!(!remaining_parts.is_empty());
    ranges[index] = remaining_parts[0];
    if remaining_parts.len() == 2 {
        ranges.insert(index + 1, remaining_parts[1]);
    }
}
