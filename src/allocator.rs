use crate::region::MemoryRegion;

/// Common interface of the variable size allocators. All of them partition
/// one [`crate::Backing`] given at construction time and never ask anybody
/// else for memory:
///
/// ```text
///                 +--------------------------------------------------+
///  Backing ---->  |                managed memory                    |
///                 +--------------------------------------------------+
///                     |              |                  |
///            allocate |     allocate |         allocate | ...
///                     v              v                  v
///                 +--------+    +---------+    +------------------+
///                 | region |    | region  |    |      region      |
///                 +--------+    +---------+    +------------------+
/// ```
///
/// Failing to allocate is not an error, implementors return
/// [`MemoryRegion::NULL`]. Misusing the allocator (invalid alignment, freeing
/// something that was never allocated, freeing twice) is a programmer error
/// and panics whenever the allocator is able to detect it.
///
/// Implementors are not thread safe unless stated otherwise, wrap them in
/// [`crate::Synchronized`] to share them.
pub trait RegionAllocator {
    /// Alignment used by [`RegionAllocator::allocate`].
    fn default_alignment(&self) -> usize;

    /// Allocates `size` bytes aligned to
    /// [`RegionAllocator::default_alignment`].
    #[inline]
    fn allocate(&mut self, size: usize) -> MemoryRegion {
        let alignment = self.default_alignment();
        self.allocate_aligned(size, alignment)
    }

    /// Allocates `size` bytes whose first address is a multiple of
    /// `alignment`. Returns [`MemoryRegion::NULL`] if there's no space left or
    /// `size` is zero.
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of two.
    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion;

    /// Gives back the allocation starting at `address`. Freeing address `0`
    /// (the address of [`MemoryRegion::NULL`]) does nothing.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this same allocator since the
    /// last [`RegionAllocator::reset`] and not freed already. Allocators check
    /// what they can cheaply check and panic on violations, anything that
    /// slips through is undefined behaviour.
    unsafe fn free(&mut self, address: usize);

    /// Forgets about every allocation at once. Regions handed out before the
    /// reset must not be used afterwards.
    fn reset(&mut self);

    /// The memory this allocator manages.
    fn region(&self) -> MemoryRegion;
}

/// Interface of allocators that only hand out chunks of one fixed size.
pub trait ChunkAllocator {
    /// Size of every chunk in bytes.
    fn chunk_size(&self) -> usize;

    /// Returns one chunk or [`MemoryRegion::NULL`] if all of them are in use.
    fn allocate(&mut self) -> MemoryRegion;

    /// Puts the chunk at `address` back into circulation. Address `0` is
    /// ignored.
    ///
    /// # Safety
    ///
    /// Same contract as [`RegionAllocator::free`].
    unsafe fn free(&mut self, address: usize);

    /// Makes every chunk available again.
    fn reset(&mut self);

    /// The memory this allocator manages.
    fn region(&self) -> MemoryRegion;
}

impl<A: RegionAllocator + ?Sized> RegionAllocator for &mut A {
    #[inline]
    fn default_alignment(&self) -> usize {
        (**self).default_alignment()
    }

    #[inline]
    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        (**self).allocate_aligned(size, alignment)
    }

    #[inline]
    unsafe fn free(&mut self, address: usize) {
        unsafe { (**self).free(address) }
    }

    #[inline]
    fn reset(&mut self) {
        (**self).reset()
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        (**self).region()
    }
}
