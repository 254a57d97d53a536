use core::mem;

use log::{debug, trace};

use crate::{
    align::{compute_padding, is_power_of_two},
    allocator::RegionAllocator,
    backing::{Backing, Link, Pod},
    errors::{or_panic, RegionError, Result},
    header::{AllocationHeader, ALLOCATION_HEADER_SIZE},
    region::MemoryRegion,
};

/// Requested alignments below this are raised to it.
pub const MIN_ALIGNMENT: usize = 8;

/// Free list node, lives at the start of every free block.
#[derive(Clone, Copy, Debug)]
struct FreeBlock {
    next: Link,
    /// Size of the whole free block, node included.
    size: usize,
}

unsafe impl Pod for FreeBlock {}

/// Blocks smaller than this can't be tracked by the free list.
const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

/// Free list allocator with first fit search. Free blocks are linked in
/// address order, which makes merging adjacent free blocks easy:
///
/// ```text
///   head
///    |
///    v
///   +------+--------+-------+---------+------------+-------+----------+
///   | Free | Used   | Used  |  Free   |    Used    | Free  |   Used   |
///   +------+--------+-------+---------+------------+-------+----------+
///      |                     ^    |                  ^
///      +---------------------+    +------------------+
/// ```
///
/// Allocation walks the list and takes the first block that fits the
/// request plus padding plus [`AllocationHeader`]. If what's left of the
/// block can hold a node of its own the block is split, otherwise the caller
/// gets the whole thing. Freeing inserts the block back in address order and
/// merges it with its neighbours if they are adjacent in memory.
pub struct FirstFitAllocator<'buf> {
    backing: Backing<'buf>,
    head: Link,
    /// Bytes in allocated blocks, headers and padding included.
    used: usize,
}

impl<'buf> FirstFitAllocator<'buf> {
    /// Builds an allocator over `backing`.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        let minimum = ALLOCATION_HEADER_SIZE + MIN_ALIGNMENT;
        if backing.len() < minimum {
            return Err(RegionError::RegionTooSmall {
                size: backing.len(),
                minimum,
            });
        }

        let mut allocator = Self {
            backing,
            head: Link::NIL,
            used: 0,
        };
        allocator.reset();

        Ok(allocator)
    }

    /// Same as [`FirstFitAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>) -> Self {
        or_panic(Self::try_new(backing))
    }

    /// Bytes taken by allocated blocks, including their headers and padding.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Free blocks in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        let mut current = self.head;

        core::iter::from_fn(move || {
            let offset = current.get()?;
            let node: FreeBlock = self.backing.read(offset);
            current = node.next;

            Some(self.backing.region_at(offset, node.size))
        })
    }

    /// Points `previous.next` (or the head, if there's no previous node) to
    /// `next`.
    fn relink(&mut self, previous: Link, next: Link) {
        match previous.get() {
            None => self.head = next,
            Some(offset) => {
                let mut node: FreeBlock = self.backing.read(offset);
                node.next = next;
                self.backing.write(offset, node);
            }
        }
    }

    /// Merges the free block at `offset` with the next one in the list if
    /// they touch. Returns whether they were merged.
    fn merge_with_next(&mut self, offset: usize) -> bool {
        let mut node: FreeBlock = self.backing.read(offset);

        let Some(next_offset) = node.next.get() else {
            return false;
        };

        if offset + node.size != next_offset {
            return false;
        }

        let next: FreeBlock = self.backing.read(next_offset);
        debug!(
            "first fit: merged free blocks at {offset} and {next_offset} ({} bytes)",
            node.size + next.size
        );

        node.size += next.size;
        node.next = next.next;
        self.backing.write(offset, node);

        true
    }
}

impl RegionAllocator for FirstFitAllocator<'_> {
    #[inline]
    fn default_alignment(&self) -> usize {
        MIN_ALIGNMENT
    }

    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        assert!(
            is_power_of_two(alignment),
            "alignment {alignment} isn't a power of 2"
        );

        if size == 0 || size > self.backing.len() {
            return MemoryRegion::NULL;
        }

        let alignment = alignment.max(MIN_ALIGNMENT);

        let mut previous = Link::NIL;
        let mut current = self.head;

        let (offset, node, padding) = loop {
            let Some(offset) = current.get() else {
                return MemoryRegion::NULL;
            };

            let node: FreeBlock = self.backing.read(offset);
            let padding = compute_padding(
                self.backing.address_at(offset),
                alignment,
                ALLOCATION_HEADER_SIZE,
            );

            if node.size >= padding + size {
                break (offset, node, padding);
            }

            previous = current;
            current = node.next;
        };

        let required = padding + size;
        let remaining = node.size - required;

        let (block_size, next) = if remaining > MIN_BLOCK_SIZE {
            let split = offset + required;
            self.backing.write(
                split,
                FreeBlock {
                    next: node.next,
                    size: remaining,
                },
            );
            (required, Link::to(split))
        } else {
            (node.size, node.next)
        };

        self.relink(previous, next);

        let content = offset + padding;
        AllocationHeader {
            block_size,
            padding,
        }
        .write_before(&mut self.backing, content);

        self.used += block_size;

        let allocation = self.backing.region_at(content, block_size - padding);
        trace!("first fit: allocated {allocation:?} from block at {offset}");

        allocation
    }

    /// # Panics
    ///
    /// If `address` is outside the managed memory, has no valid header in
    /// front of it, or its block overlaps a free block (double free).
    unsafe fn free(&mut self, address: usize) {
        if address == 0 {
            return;
        }

        assert!(
            self.backing.contains(address),
            "first fit: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        // A freed block's node may sit where its header used to be, so look
        // for the address in the free list before trusting the header.
        assert!(
            !self.free_blocks().any(|free| free.contains(address)),
            "first fit: double free of {address:#x}"
        );

        let content = self.backing.offset_of(address);
        let header = AllocationHeader::read_before(&self.backing, content);
        let block = header.block_start(content);

        // Find the free blocks around this one.
        let mut previous = Link::NIL;
        let mut current = self.head;

        while let Some(offset) = current.get() {
            if offset >= block {
                break;
            }
            previous = current;
            current = self.backing.read::<FreeBlock>(offset).next;
        }

        let overlaps_previous = previous.get().is_some_and(|offset| {
            offset + self.backing.read::<FreeBlock>(offset).size > block
        });
        let overlaps_next = current
            .get()
            .is_some_and(|offset| offset < block + header.block_size);

        assert!(
            !overlaps_previous && !overlaps_next,
            "first fit: double free of {address:#x}"
        );

        self.backing.write(
            block,
            FreeBlock {
                next: current,
                size: header.block_size,
            },
        );
        self.relink(previous, Link::to(block));
        self.used -= header.block_size;

        trace!("first fit: freed block of {} bytes at {block}", header.block_size);

        self.merge_with_next(block);
        if let Some(offset) = previous.get() {
            self.merge_with_next(offset);
        }
    }

    fn reset(&mut self) {
        debug!("first fit: reset with {} bytes in use", self.used);

        let size = self.backing.len();
        self.backing.write(
            0,
            FreeBlock {
                next: Link::NIL,
                size,
            },
        );
        self.head = Link::to(0);
        self.used = 0;
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}
