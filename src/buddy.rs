use core::mem;

use log::{debug, trace, warn};

use crate::{
    align::{align_up, is_aligned, is_power_of_two},
    allocator::RegionAllocator,
    backing::{Backing, Pod},
    errors::{or_panic, RegionError, Result},
    region::MemoryRegion,
};

/// Block header. Size and free flag packed in one word, the flag takes the
/// most significant bit:
///
/// ```text
///   63  62                                                               0
///  +----+-----------------------------------------------------------------+
///  |free|                         block size                              |
///  +----+-----------------------------------------------------------------+
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct BuddyHeader(usize);

unsafe impl Pod for BuddyHeader {}

const FREE_BIT: usize = 1 << (usize::BITS - 1);

/// Size of [`BuddyHeader`] and default alignment of [`BuddyAllocator`].
pub const HEADER_SIZE: usize = mem::size_of::<BuddyHeader>();

impl BuddyHeader {
    #[inline]
    fn new(size: usize, free: bool) -> Self {
        debug_assert!(size & FREE_BIT == 0);
        Self(if free { size | FREE_BIT } else { size })
    }

    #[inline]
    fn size(self) -> usize {
        self.0 & !FREE_BIT
    }

    #[inline]
    fn is_free(self) -> bool {
        self.0 & FREE_BIT != 0
    }
}

/// One block of the buddy allocator as seen from outside. See
/// [`BuddyAllocator::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuddyBlock {
    /// Whole block, header included.
    pub region: MemoryRegion,
    pub free: bool,
}

/// Binary buddy allocator. The managed memory, whose size must be a power of
/// two, is a sequence of power of two sized blocks that always covers it
/// completely. Each block starts with a [`BuddyHeader`] padded to the
/// alignment (the "slot"), followed by content:
///
/// ```text
///   offset 0                                                       len
///   |                                                               |
///   v                                                               v
///   +-----------------------------------+---------------+-------+---+
///   |               free                |     used      | used  |fr.|
///   +-----------------------------------+---------------+-------+---+
///   <----------- len / 2 ---------------><-- len / 4 --><- len / 8 ->
/// ```
///
/// Allocating looks for the smallest free block that fits the request plus
/// its header and halves it until halving again would make it too small.
/// The two halves of a split are buddies: when both are free and still the
/// same size they can merge back together. Merging is lazy, freeing only
/// flips the flag. Searches merge free buddies they come across and, if
/// nothing fits, a full coalescing pass runs before searching once more.
pub struct BuddyAllocator<'buf> {
    backing: Backing<'buf>,
    /// Bytes reserved in front of each block's content for the header. Also
    /// the maximum alignment the allocator can satisfy.
    slot: usize,
}

impl<'buf> BuddyAllocator<'buf> {
    /// Builds an allocator with [`HEADER_SIZE`] alignment.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        Self::try_with_alignment(backing, HEADER_SIZE)
    }

    /// Same as [`BuddyAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>) -> Self {
        or_panic(Self::try_new(backing))
    }

    /// Builds an allocator whose allocations are aligned to `alignment`.
    /// Alignments smaller than [`HEADER_SIZE`] are raised to it. The backing
    /// memory length must be a power of two and its base address must be
    /// aligned to `alignment`.
    pub fn try_with_alignment(backing: impl Into<Backing<'buf>>, alignment: usize) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        if !is_power_of_two(alignment) {
            return Err(RegionError::InvalidAlignment { alignment });
        }

        if !is_power_of_two(backing.len()) {
            return Err(RegionError::SizeNotPowerOfTwo {
                size: backing.len(),
            });
        }

        let slot = alignment.max(HEADER_SIZE);

        if !is_aligned(backing.address(), slot) {
            return Err(RegionError::MisalignedBase {
                address: backing.address(),
                alignment: slot,
            });
        }

        // The smallest block holds a header and at least one byte.
        if backing.len() < 2 * slot {
            return Err(RegionError::RegionTooSmall {
                size: backing.len(),
                minimum: 2 * slot,
            });
        }

        let mut buddy = Self { backing, slot };
        buddy.reset();

        Ok(buddy)
    }

    /// Same as [`BuddyAllocator::try_with_alignment`] but panics on invalid
    /// input.
    #[track_caller]
    pub fn with_alignment(backing: impl Into<Backing<'buf>>, alignment: usize) -> Self {
        or_panic(Self::try_with_alignment(backing, alignment))
    }

    /// Walks every block from the start of the managed memory to its end.
    pub fn blocks(&self) -> impl Iterator<Item = BuddyBlock> + '_ {
        let mut offset = 0;

        core::iter::from_fn(move || {
            if offset >= self.backing.len() {
                return None;
            }

            let header = self.header(offset);
            let block = BuddyBlock {
                region: self.backing.region_at(offset, header.size()),
                free: header.is_free(),
            };
            offset += header.size();

            Some(block)
        })
    }

    /// Reads the header at `offset`, checking that it describes a block that
    /// fits in the managed memory.
    #[track_caller]
    fn header(&self, offset: usize) -> BuddyHeader {
        let header: BuddyHeader = self.backing.read(offset);
        let size = header.size();

        assert!(
            is_power_of_two(size)
                && size >= 2 * self.slot
                && offset % size == 0
                && offset + size <= self.backing.len(),
            "buddy: corrupted header at offset {offset} (size {size})"
        );

        header
    }

    #[inline]
    fn write_header(&mut self, offset: usize, size: usize, free: bool) {
        self.backing.write(offset, BuddyHeader::new(size, free));
    }

    /// Block size needed for `size` bytes of content.
    #[inline]
    fn block_size_for(&self, size: usize) -> usize {
        align_up(size + self.slot, self.slot).next_power_of_two()
    }

    /// If the block at `offset` is free and its buddy to the right is free
    /// and equally sized, merges them and returns the merged header.
    ///
    /// Only left buddies merge with their right neighbour. A free block whose
    /// offset is an odd multiple of its size is a right buddy, merging it
    /// with its neighbour would produce a misaligned block.
    fn merge_with_buddy(&mut self, offset: usize, header: BuddyHeader) -> Option<BuddyHeader> {
        let size = header.size();

        if !header.is_free() || offset % (2 * size) != 0 || offset + size >= self.backing.len() {
            return None;
        }

        let buddy = self.header(offset + size);

        if !buddy.is_free() || buddy.size() != size {
            return None;
        }

        debug!("buddy: merged blocks at {offset} and {} ({size} bytes each)", offset + size);
        self.write_header(offset, 2 * size, true);

        Some(BuddyHeader::new(2 * size, true))
    }

    /// Returns the offset of the smallest free block of at least `required`
    /// bytes, lowest address on ties. Free buddies found on the way are merged.
    fn search_blocks(&mut self, required: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        let mut offset = 0;

        while offset < self.backing.len() {
            let mut header = self.header(offset);

            if let Some(merged) = self.merge_with_buddy(offset, header) {
                header = merged;
            }

            if header.is_free()
                && header.size() >= required
                && best.map_or(true, |(_, size)| header.size() < size)
            {
                best = Some((offset, header.size()));
            }

            offset += header.size();
        }

        best.map(|(offset, _)| offset)
    }

    /// Merges free buddies across the whole memory, repeating full passes
    /// until nothing changes. Returns the number of merges.
    pub fn coalesce(&mut self) -> usize {
        let mut merges = 0;

        loop {
            let mut merged_in_pass = false;
            let mut offset = 0;

            while offset < self.backing.len() {
                let mut header = self.header(offset);

                if let Some(merged) = self.merge_with_buddy(offset, header) {
                    header = merged;
                    merges += 1;
                    merged_in_pass = true;
                }

                offset += header.size();
            }

            if !merged_in_pass {
                break;
            }
        }

        debug!("buddy: coalescing pass merged {merges} pairs");

        merges
    }

    /// Halves the free block at `offset` until it's exactly `required` bytes.
    fn split_block(&mut self, offset: usize, required: usize) {
        let mut size = self.header(offset).size();

        while size > required {
            size /= 2;
            self.write_header(offset, size, true);
            self.write_header(offset + size, size, true);
            debug!("buddy: split block at {offset} into two halves of {size} bytes");
        }
    }
}

impl RegionAllocator for BuddyAllocator<'_> {
    #[inline]
    fn default_alignment(&self) -> usize {
        self.slot
    }

    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        assert!(
            is_power_of_two(alignment),
            "alignment {alignment} isn't a power of 2"
        );

        if alignment > self.slot {
            warn!(
                "buddy: can't align to {alignment} bytes, allocator was built for {}",
                self.slot
            );
            return MemoryRegion::NULL;
        }

        if size == 0 || size > self.backing.len() {
            return MemoryRegion::NULL;
        }

        let required = self.block_size_for(size);

        if required > self.backing.len() {
            return MemoryRegion::NULL;
        }

        let found = match self.search_blocks(required) {
            Some(offset) => Some(offset),
            None => {
                self.coalesce();
                self.search_blocks(required)
            }
        };

        let Some(offset) = found else {
            return MemoryRegion::NULL;
        };

        self.split_block(offset, required);
        self.write_header(offset, required, false);

        let allocation = self.backing.region_at(offset + self.slot, size);
        trace!("buddy: allocated {allocation:?} in a block of {required} bytes");

        allocation
    }

    /// Marks the block of `address` as free. Merging happens later.
    ///
    /// # Panics
    ///
    /// If `address` is outside the managed memory, doesn't point right after
    /// a block header, or the block is already free.
    unsafe fn free(&mut self, address: usize) {
        if address == 0 {
            return;
        }

        assert!(
            self.backing.contains(address),
            "buddy: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        let block = self
            .backing
            .offset_of(address)
            .checked_sub(self.slot)
            .filter(|block| block % (2 * self.slot) == 0);

        let Some(block) = block else {
            panic!("buddy: {address:#x} is not the start of an allocation");
        };

        let header = self.header(block);

        assert!(!header.is_free(), "buddy: double free of {address:#x}");

        self.write_header(block, header.size(), true);
        trace!("buddy: freed block of {} bytes at {address:#x}", header.size());
    }

    fn reset(&mut self) {
        debug!("buddy: reset to one block of {} bytes", self.backing.len());
        let len = self.backing.len();
        self.write_header(0, len, true);
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{align::kib, pages::Pages};

    fn block_sizes(buddy: &BuddyAllocator) -> Vec<(usize, bool)> {
        buddy.blocks().map(|b| (b.region.size, b.free)).collect()
    }

    #[test_log::test]
    fn coalesce_freed_buddies() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());

        let size = kib(1) - 16;

        let allocations: Vec<_> = (0..4).map(|_| buddy.allocate(size)).collect();
        assert!(allocations.iter().all(|a| !a.is_null()));
        assert!(buddy.allocate(size).is_null());

        unsafe {
            buddy.free(allocations[1].address);
            buddy.free(allocations[3].address);
            buddy.free(allocations[2].address);
        }

        let large = buddy.allocate(kib(2) - 16);
        assert!(!large.is_null());
        assert_eq!(large.address, allocations[2].address);
        assert_eq!(
            block_sizes(&buddy),
            [(1024, false), (1024, true), (2048, false)]
        );
    }

    #[test]
    fn typical_usage() {
        let mut pages = Pages::new(4096);
        let mut buddy = BuddyAllocator::with_alignment(&mut pages.as_mut_slice()[..512], 16);

        let a = buddy.allocate(38);
        let b = buddy.allocate(122);
        let c = buddy.allocate(16);

        for allocation in [a, b, c] {
            assert!(!allocation.is_null());
            assert!(is_aligned(allocation.address, 16));
        }

        assert_eq!(
            block_sizes(&buddy),
            [(64, false), (32, false), (32, true), (128, true), (256, false)]
        );

        // Needs a 256 byte block and the only one is taken.
        assert!(buddy.allocate(172).is_null());

        unsafe { buddy.free(b.address) };
        let d = buddy.allocate(172);
        assert_eq!(d.address, b.address);

        unsafe {
            buddy.free(a.address);
            buddy.free(c.address);
            buddy.free(d.address);
        }

        // Everything is free again, but only as small blocks until the
        // coalescing pass kicks in.
        let whole = buddy.allocate(512 - 16);
        assert_eq!(whole.address, buddy.region().address + 16);
        assert_eq!(block_sizes(&buddy), [(512, false)]);
    }

    #[test]
    fn out_of_memory() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::with_alignment(pages.as_mut_slice(), 16);

        assert!(!buddy.allocate(kib(1)).is_null());
        assert!(!buddy.allocate(kib(1)).is_null());
        assert!(buddy.allocate(kib(1)).is_null());
    }

    #[test]
    fn smallest_block_wins() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());

        let small = buddy.allocate(100);
        let _guard = buddy.allocate(100);
        let big = buddy.allocate(900);

        unsafe {
            buddy.free(big.address);
            buddy.free(small.address);
        }

        // Both freed blocks fit, the 128 byte one is the best fit.
        assert_eq!(buddy.allocate(50).address, small.address);
    }

    #[test]
    fn blocks_cover_region_and_stay_aligned() {
        let mut pages = Pages::new(kib(8));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());
        let base = buddy.region().address;

        let mut live = Vec::new();
        for (i, size) in [10, 300, 64, 1000, 5, 2000, 120].into_iter().enumerate() {
            live.push(buddy.allocate(size));
            if i % 3 == 2 {
                let freed = live.remove(0);
                unsafe { buddy.free(freed.address) };
            }
        }

        let mut expected = base;
        for block in buddy.blocks() {
            assert_eq!(block.region.address, expected);
            assert!(is_power_of_two(block.region.size));
            assert_eq!((block.region.address - base) % block.region.size, 0);
            expected = block.region.end();
        }
        assert_eq!(expected, buddy.region().end());
    }

    #[test]
    fn rejects_large_alignment() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());

        assert!(buddy.allocate_aligned(64, 32).is_null());
        assert!(!buddy.allocate_aligned(64, 8).is_null());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());
        let allocation = buddy.allocate(64);

        unsafe {
            buddy.free(allocation.address);
            buddy.free(allocation.address);
        }
    }

    #[test]
    #[should_panic(expected = "not the start of an allocation")]
    fn free_inside_allocation() {
        let mut pages = Pages::new(kib(4));
        let mut buddy = BuddyAllocator::new(pages.as_mut_slice());
        let allocation = buddy.allocate(64);

        unsafe { buddy.free(allocation.address + 8) };
    }

    #[test]
    fn construction_contract() {
        let mut pages = Pages::new(kib(4));
        let base = pages.address();
        let bytes = pages.as_mut_slice();

        assert_eq!(
            BuddyAllocator::try_new(&mut bytes[..3000]).err(),
            Some(RegionError::SizeNotPowerOfTwo { size: 3000 })
        );
        assert_eq!(
            BuddyAllocator::try_with_alignment(&mut bytes[..1024], 12).err(),
            Some(RegionError::InvalidAlignment { alignment: 12 })
        );
        assert_eq!(
            BuddyAllocator::try_with_alignment(&mut bytes[8..1032], 16).err(),
            Some(RegionError::MisalignedBase {
                address: base + 8,
                alignment: 16
            })
        );
        assert!(BuddyAllocator::try_new(&mut bytes[8..1032]).is_ok());
        assert_eq!(
            BuddyAllocator::try_new(&mut bytes[..8]).err(),
            Some(RegionError::RegionTooSmall { size: 8, minimum: 16 })
        );
    }
}
