use core::mem;

use log::{debug, trace};

use crate::{
    align::compute_padding,
    allocator::RegionAllocator,
    backing::{Backing, Pod},
    errors::{or_panic, RegionError, Result},
    region::MemoryRegion,
};

/// Alignment of [`RegionAllocator::allocate`] requests.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Written right before every allocation. Allows rolling back the markers
/// when the allocation is freed.
#[derive(Clone, Copy, Debug)]
struct StackHeader {
    /// Start of the allocation that was on top of the stack before this one.
    previous_offset: usize,
    /// Distance from the start of this allocation's block to its content.
    padding: usize,
}

unsafe impl Pod for StackHeader {}

const HEADER_SIZE: usize = mem::size_of::<StackHeader>();

/// LIFO allocator. Works like [`crate::BumpAllocator`] but remembers enough
/// about each allocation to undo it, as long as allocations are freed in the
/// reverse order they were made:
///
/// ```text
///                       previous                       current
///                          |                              |
///                          v                              v
///   +-----+--------+-------+-----+--------+---------------+-------------+
///   | pad | header | alloc | pad | header |     alloc     |  available  |
///   +-----+--------+-------+-----+--------+---------------+-------------+
///                          <--- padding -->
/// ```
///
/// `previous` is where the block of the topmost allocation starts, so freeing
/// it brings `current` back there and restores `previous` from the header.
/// Freeing anything other than the topmost allocation panics.
pub struct StackAllocator<'buf> {
    backing: Backing<'buf>,
    current: usize,
    previous: usize,
}

impl<'buf> StackAllocator<'buf> {
    /// Builds an allocator over `backing`.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        if backing.len() <= HEADER_SIZE {
            return Err(RegionError::RegionTooSmall {
                size: backing.len(),
                minimum: HEADER_SIZE + 1,
            });
        }

        Ok(Self {
            backing,
            current: 0,
            previous: 0,
        })
    }

    /// Same as [`StackAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>) -> Self {
        or_panic(Self::try_new(backing))
    }

    /// Bytes consumed so far, headers and padding included.
    #[inline]
    pub fn used(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.backing.len() - self.current
    }

    /// Offset where the block of the topmost allocation starts.
    #[inline]
    pub fn previous_marker(&self) -> usize {
        self.previous
    }
}

impl RegionAllocator for StackAllocator<'_> {
    #[inline]
    fn default_alignment(&self) -> usize {
        DEFAULT_ALIGNMENT
    }

    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        let padding = compute_padding(
            self.backing.address_at(self.current),
            alignment,
            HEADER_SIZE,
        );
        let start = self.current + padding;

        if size == 0 || size > self.backing.len() || start + size > self.backing.len() {
            return MemoryRegion::NULL;
        }

        self.backing.write(
            start - HEADER_SIZE,
            StackHeader {
                previous_offset: self.previous,
                padding,
            },
        );

        self.previous = self.current;
        self.current = start + size;
        self.backing.zero(start, size);

        let allocation = self.backing.region_at(start, size);
        trace!("stack: allocated {allocation:?} with {padding} bytes of padding");

        allocation
    }

    /// Pops the topmost allocation.
    ///
    /// # Panics
    ///
    /// If `address` is outside of the managed memory, was already freed or is
    /// not the most recent live allocation.
    unsafe fn free(&mut self, address: usize) {
        if address == 0 {
            return;
        }

        assert!(
            self.backing.contains(address),
            "stack: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        let offset = self.backing.offset_of(address);

        assert!(
            offset < self.current && offset >= HEADER_SIZE,
            "stack: double free of {address:#x}"
        );

        let header: StackHeader = self.backing.read(offset - HEADER_SIZE);
        let block_start = offset.checked_sub(header.padding);

        assert!(
            block_start == Some(self.previous),
            "stack: out of order free of {address:#x}, only the topmost allocation can be freed"
        );

        trace!("stack: freed {address:#x}");

        self.current = self.previous;
        self.previous = header.previous_offset;
    }

    fn reset(&mut self) {
        debug!("stack: reset after using {} bytes", self.current);
        self.current = 0;
        self.previous = 0;
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}
