use log::{debug, trace};

use crate::{
    align::align_up,
    allocator::RegionAllocator,
    backing::Backing,
    errors::{or_panic, RegionError, Result},
    region::MemoryRegion,
};

/// Alignment of [`RegionAllocator::allocate`] requests.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Simplest possible allocator. Keeps one offset into the managed memory and
/// moves it forward on every allocation:
///
/// ```text
///  base                        offset                             base + len
///   |                            |                                    |
///   v                            v                                    v
///   +-------+---+-------+--------+------------------------------------+
///   | alloc |pad| alloc |  alloc |              available             |
///   +-------+---+-------+--------+------------------------------------+
/// ```
///
/// Individual allocations can't be freed, [`RegionAllocator::free`] does
/// nothing. [`RegionAllocator::reset`] moves the offset back to zero and
/// makes the whole memory available again. Granted memory is always zeroed.
pub struct BumpAllocator<'buf> {
    backing: Backing<'buf>,
    /// Offset of the first byte that has never been allocated since the last
    /// reset.
    offset: usize,
}

/// Another name for [`BumpAllocator`].
pub type ArenaAllocator<'buf> = BumpAllocator<'buf>;

impl<'buf> BumpAllocator<'buf> {
    /// Builds an allocator over `backing`.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        Ok(Self { backing, offset: 0 })
    }

    /// Same as [`BumpAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>) -> Self {
        or_panic(Self::try_new(backing))
    }

    /// Bytes consumed so far, padding included.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Bytes that have never been handed out since the last reset. Alignment
    /// may prevent all of them from being usable by one allocation.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.backing.len() - self.offset
    }
}

impl RegionAllocator for BumpAllocator<'_> {
    #[inline]
    fn default_alignment(&self) -> usize {
        DEFAULT_ALIGNMENT
    }

    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        let base = self.backing.address();
        let offset = align_up(base + self.offset, alignment) - base;

        if size == 0 || size > self.backing.len() || offset + size > self.backing.len() {
            return MemoryRegion::NULL;
        }

        self.offset = offset + size;
        self.backing.zero(offset, size);

        let allocation = self.backing.region_at(offset, size);
        trace!("bump: allocated {allocation:?}, used {}", self.offset);

        allocation
    }

    unsafe fn free(&mut self, _address: usize) {}

    fn reset(&mut self) {
        debug!("bump: reset after using {} bytes", self.offset);
        self.offset = 0;
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::Pages;

    #[test_log::test]
    fn test_bump_allocator() {
        let mut pages = Pages::new(4096);
        let base = pages.address();
        let mut bump = BumpAllocator::new(pages.as_mut_slice());

        unsafe {
            // Allocate memory for one item.
            let first = bump.allocate(8);
            assert_eq!(first, MemoryRegion::new(base, 8));
            let first_addr = first.as_mut_ptr() as *mut u64;
            *first_addr = 3u64;

            // Array of items of different type. Should skip 8 bytes of
            // padding because of the default alignment.
            let size = 6;
            let second = bump.allocate(size * 2);
            assert_eq!(second.address, base + 16);
            let second_addr = second.as_mut_ptr() as *mut u16;
            for i in 0..size {
                *second_addr.add(i) = (i + 1) as u16;
            }

            // Check that nothing has been corrupted.
            assert_eq!(*first_addr, 3);
            for i in 0..size {
                assert_eq!((i + 1) as u16, *second_addr.add(i));
            }

            // Free doesn't do anything.
            bump.free(first.address);
            assert_eq!(bump.allocate(8).address, base + 32);
        }

        assert_eq!(bump.used(), 40);
        assert_eq!(bump.remaining(), 4096 - 40);
    }

    #[test]
    fn exact_capacity() {
        let mut pages = Pages::new(4096);
        let mut bump = BumpAllocator::new(pages.as_mut_slice());

        assert!(bump.allocate(4097).is_null());
        assert!(!bump.allocate(4000).is_null());
        // 4000 is a multiple of 16, so exactly 96 bytes remain.
        assert!(bump.allocate(97).is_null());
        assert!(!bump.allocate(96).is_null());
        assert_eq!(bump.remaining(), 0);
        assert!(bump.allocate_aligned(1, 1).is_null());
    }

    #[test]
    fn failed_allocation_keeps_offset() {
        let mut pages = Pages::new(4096);
        let mut bump = BumpAllocator::new(pages.as_mut_slice());

        bump.allocate(3);
        assert!(bump.allocate_aligned(4000, 2048).is_null());
        assert_eq!(bump.used(), 3);
    }

    #[test]
    fn granted_memory_is_zeroed() {
        let mut pages = Pages::new(4096);
        pages.as_mut_slice().fill(0xff);
        let mut bump = BumpAllocator::new(pages.as_mut_slice());

        let allocation = bump.allocate(128);
        let bytes = unsafe { allocation.as_mut_slice() };
        assert!(bytes.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn reset_reuses_memory() {
        let mut pages = Pages::new(4096);
        let mut bump = ArenaAllocator::new(pages.as_mut_slice());

        let first = bump.allocate(1024);
        unsafe { first.as_mut_slice().fill(7) };
        bump.allocate(1024);

        bump.reset();

        let again = bump.allocate(1024);
        assert_eq!(again, first);
        assert!(unsafe { again.as_mut_slice() }.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn rejects_empty_backing() {
        let mut empty: [u8; 0] = [];
        assert_eq!(
            BumpAllocator::try_new(&mut empty[..]).err(),
            Some(RegionError::NullRegion)
        );
    }

    #[test]
    #[should_panic(expected = "isn't a power of 2")]
    fn rejects_invalid_alignment() {
        let mut buffer = [0u8; 64];
        BumpAllocator::new(&mut buffer).allocate_aligned(8, 24);
    }
}
