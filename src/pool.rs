use core::mem;

use log::{debug, trace};

use crate::{
    align::{align_up, is_power_of_two},
    allocator::ChunkAllocator,
    backing::{Backing, Link},
    errors::{or_panic, RegionError, Result},
    region::MemoryRegion,
};

/// Smallest chunk that can hold the free list link.
pub const MIN_CHUNK_SIZE: usize = mem::size_of::<Link>();

/// Fixed size allocator. The managed memory is cut into equally sized chunks
/// and every free chunk stores the offset of the next free chunk in its first
/// bytes, so the free list costs no memory at all:
///
/// ```text
///            head
///             |
///             v
///   +-----+---------+---------+---------+---------+---------+------+
///   | pad |  free   |  used   |  free   |  free   |  used   | tail |
///   +-----+---------+---------+---------+---------+---------+------+
///              |                 ^   |     ^
///              +-----------------+   +-----+
/// ```
///
/// Leading bytes before the first aligned chunk and trailing bytes that can't
/// hold a whole chunk are never used. Allocation and deallocation are O(1).
pub struct ChunkPoolAllocator<'buf> {
    backing: Backing<'buf>,
    /// Offset of the first chunk.
    start: usize,
    chunk_size: usize,
    chunk_count: usize,
    /// First free chunk.
    head: Link,
    available: usize,
}

/// Another name for [`ChunkPoolAllocator`].
pub type BlockAllocator<'buf> = ChunkPoolAllocator<'buf>;

/// Validated chunk geometry shared with the lock-free pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub start: usize,
    pub chunk_size: usize,
    pub chunk_count: usize,
}

impl Geometry {
    /// Computes where chunks go inside `backing`. `chunk_size` is rounded up to
    /// `chunk_alignment` and the first chunk starts at the first aligned
    /// address.
    pub fn new(backing: &Backing, chunk_size: usize, chunk_alignment: usize) -> Result<Self> {
        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        if !is_power_of_two(chunk_alignment) {
            return Err(RegionError::InvalidAlignment {
                alignment: chunk_alignment,
            });
        }

        if chunk_size < MIN_CHUNK_SIZE {
            return Err(RegionError::ChunkTooSmall {
                chunk_size,
                minimum: MIN_CHUNK_SIZE,
            });
        }

        let chunk_size = align_up(chunk_size, chunk_alignment);
        let start = align_up(backing.address(), chunk_alignment) - backing.address();

        if start + chunk_size > backing.len() {
            return Err(RegionError::RegionTooSmall {
                size: backing.len(),
                minimum: start + chunk_size,
            });
        }

        Ok(Self {
            start,
            chunk_size,
            chunk_count: (backing.len() - start) / chunk_size,
        })
    }

    /// Offset of the chunk at `index`.
    #[inline]
    pub fn chunk(&self, index: usize) -> usize {
        self.start + index * self.chunk_size
    }

    /// Panics unless `offset` is the first byte of some chunk.
    #[track_caller]
    pub fn check_chunk(&self, offset: usize) {
        let relative = offset.checked_sub(self.start);
        assert!(
            relative.is_some_and(|r| r % self.chunk_size == 0 && r / self.chunk_size < self.chunk_count),
            "pool: offset {offset} is not the start of a chunk"
        );
    }
}

impl<'buf> ChunkPoolAllocator<'buf> {
    /// Builds a pool of `chunk_size` byte chunks aligned to `chunk_alignment`.
    /// Chunk size is rounded up to the alignment.
    pub fn try_new(
        backing: impl Into<Backing<'buf>>,
        chunk_size: usize,
        chunk_alignment: usize,
    ) -> Result<Self> {
        let backing = backing.into();
        let geometry = Geometry::new(&backing, chunk_size, chunk_alignment)?;

        let mut pool = Self {
            backing,
            start: geometry.start,
            chunk_size: geometry.chunk_size,
            chunk_count: geometry.chunk_count,
            head: Link::NIL,
            available: 0,
        };

        pool.thread_chunks();

        Ok(pool)
    }

    /// Same as [`ChunkPoolAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>, chunk_size: usize, chunk_alignment: usize) -> Self {
        or_panic(Self::try_new(backing, chunk_size, chunk_alignment))
    }

    /// Total number of chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Number of chunks that can still be allocated.
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            start: self.start,
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
        }
    }

    /// Links every chunk into the free list. Pushing from the last chunk to
    /// the first leaves the lowest address at the head.
    fn thread_chunks(&mut self) {
        let geometry = self.geometry();
        self.head = Link::NIL;

        for index in (0..self.chunk_count).rev() {
            let chunk = geometry.chunk(index);
            self.backing.write(chunk, self.head);
            self.head = Link::to(chunk);
        }

        self.available = self.chunk_count;
    }
}

impl ChunkAllocator for ChunkPoolAllocator<'_> {
    #[inline]
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn allocate(&mut self) -> MemoryRegion {
        let Some(chunk) = self.head.get() else {
            return MemoryRegion::NULL;
        };

        self.head = self.backing.read(chunk);
        self.available -= 1;

        let allocation = self.backing.region_at(chunk, self.chunk_size);
        trace!("pool: allocated {allocation:?}, {} left", self.available);

        allocation
    }

    /// # Panics
    ///
    /// If `address` is not the start of a chunk of this pool or every chunk
    /// is already free.
    unsafe fn free(&mut self, address: usize) {
        if address == 0 {
            return;
        }

        assert!(
            self.backing.contains(address),
            "pool: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        let chunk = self.backing.offset_of(address);
        self.geometry().check_chunk(chunk);

        assert!(
            self.available < self.chunk_count,
            "pool: double free of {address:#x}, every chunk is already free"
        );

        self.backing.write(chunk, self.head);
        self.head = Link::to(chunk);
        self.available += 1;

        trace!("pool: freed {address:#x}");
    }

    fn reset(&mut self) {
        debug!(
            "pool: reset with {} of {} chunks in use",
            self.chunk_count - self.available,
            self.chunk_count
        );
        self.thread_chunks();
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
    use crate::pages::Pages;

    #[test_log::test]
    fn allocates_every_chunk_once() {
        let mut pages = Pages::new(4096);
        let base = pages.address();
        let mut pool = ChunkPoolAllocator::new(pages.as_mut_slice(), 64, 16);

        assert_eq!(pool.chunk_count(), 64);

        let chunks: Vec<_> = (0..64).map(|_| pool.allocate()).collect();

        // Lowest address first, then in order.
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(*chunk, MemoryRegion::new(base + i * 64, 64));
        }

        assert!(pool.allocate().is_null());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn free_pushes_to_head() {
        let mut pages = Pages::new(4096);
        let mut pool = BlockAllocator::new(pages.as_mut_slice(), 128, 8);

        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();

        unsafe {
            a.as_mut_slice().fill(1);
            c.as_mut_slice().fill(3);

            pool.free(b.address);
            assert_eq!(pool.allocate(), b);

            pool.free(a.address);
            pool.free(c.address);
        }

        // Last freed comes out first.
        assert_eq!(pool.allocate(), c);
        assert_eq!(pool.allocate(), a);
        assert_eq!(pool.available(), pool.chunk_count() - 3);
    }

    #[test]
    fn rounds_chunk_size_and_skips_unaligned_prefix() {
        let mut pages = Pages::new(4096);
        let base = pages.address();
        // Start 3 bytes into the page so the first chunk has to be realigned.
        let mut pool = ChunkPoolAllocator::new(&mut pages.as_mut_slice()[3..], 20, 32);

        assert_eq!(pool.chunk_size(), 32);
        // 4093 bytes minus 29 bytes of padding.
        assert_eq!(pool.chunk_count(), 4064 / 32);

        let first = pool.allocate();
        assert_eq!(first.address, base + 32);
    }

    #[test]
    fn reset_rebuilds_free_list() {
        let mut pages = Pages::new(4096);
        let mut pool = ChunkPoolAllocator::new(pages.as_mut_slice(), 1024, 8);

        let first = pool.allocate();
        while !pool.allocate().is_null() {}

        pool.reset();

        assert_eq!(pool.available(), 4);
        assert_eq!(pool.allocate(), first);
    }

    #[test]
    #[should_panic(expected = "not the start of a chunk")]
    fn free_inside_chunk() {
        let mut pages = Pages::new(4096);
        let mut pool = ChunkPoolAllocator::new(pages.as_mut_slice(), 64, 8);
        let chunk = pool.allocate();

        unsafe { pool.free(chunk.address + 8) };
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn free_out_of_range() {
        let mut pages = Pages::new(4096);
        let mut pool = ChunkPoolAllocator::new(pages.as_mut_slice(), 64, 8);
        let address = pool.region().address - 64;

        unsafe { pool.free(address) };
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn free_with_nothing_allocated() {
        let mut pages = Pages::new(4096);
        let mut pool = ChunkPoolAllocator::new(pages.as_mut_slice(), 64, 8);
        let address = pool.region().address;

        unsafe { pool.free(address) };
    }

    #[test]
    fn construction_contract() {
        let mut buffer = [0u8; 64];

        assert_eq!(
            ChunkPoolAllocator::try_new(&mut buffer, 4, 4).err(),
            Some(RegionError::ChunkTooSmall {
                chunk_size: 4,
                minimum: MIN_CHUNK_SIZE
            })
        );
        assert_eq!(
            ChunkPoolAllocator::try_new(&mut buffer, 16, 3).err(),
            Some(RegionError::InvalidAlignment { alignment: 3 })
        );
        assert!(matches!(
            ChunkPoolAllocator::try_new(&mut buffer, 128, 8),
            Err(RegionError::RegionTooSmall { .. })
        ));
    }
}
