//! Allocators that can be shared between threads without a lock.
//!
//! Only allocation is concurrent: [`LockFreeBumpAllocator::allocate_aligned`]
//! and [`LockFreeChunkPoolAllocator::allocate`] take `&self` and retry a
//! compare and swap until they either win the race or run out of space.
//! Freeing and resetting take `&mut self`, so they can't race with anything.

use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::{
    align::{align_up, is_power_of_two},
    allocator::{ChunkAllocator, RegionAllocator},
    backing::{Backing, Link},
    bump,
    errors::{or_panic, RegionError, Result},
    pool::Geometry,
    region::MemoryRegion,
};

/// [`crate::BumpAllocator`] whose offset is an atomic. Many threads can
/// allocate at the same time through a shared reference:
///
/// ```text
///   thread 1 ---+
///               |  CAS(offset, offset + size)
///   thread 2 ---+-------------------------------->  offset
///               |
///   thread 3 ---+
/// ```
///
/// The losers of a race recompute their allocation from the new offset and
/// try again. A request that doesn't fit fails without touching the offset.
/// Unlike [`crate::BumpAllocator`], granted memory is not zeroed.
pub struct LockFreeBumpAllocator<'buf> {
    backing: Backing<'buf>,
    offset: CachePadded<AtomicUsize>,
}

impl<'buf> LockFreeBumpAllocator<'buf> {
    /// Builds an allocator over `backing`.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        Ok(Self {
            backing,
            offset: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Same as [`LockFreeBumpAllocator::try_new`] but panics on invalid input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>) -> Self {
        or_panic(Self::try_new(backing))
    }

    /// Allocates `size` bytes with [`bump::DEFAULT_ALIGNMENT`].
    #[inline]
    pub fn allocate(&self, size: usize) -> MemoryRegion {
        self.allocate_aligned(size, bump::DEFAULT_ALIGNMENT)
    }

    /// Allocates `size` bytes aligned to `alignment`. Safe to call from many
    /// threads at once.
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of two.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> MemoryRegion {
        assert!(
            is_power_of_two(alignment),
            "alignment {alignment} isn't a power of 2"
        );

        let base = self.backing.address();
        let length = self.backing.len();

        if size == 0 || size > length {
            return MemoryRegion::NULL;
        }

        let mut current = self.offset.load(Ordering::Relaxed);

        loop {
            let start = align_up(base + current, alignment) - base;
            let end = match start.checked_add(size) {
                Some(end) if end <= length => end,
                _ => return MemoryRegion::NULL,
            };

            match self
                .offset
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let allocation = self.backing.region_at(start, size);
                    trace!("lock-free bump: allocated {allocation:?}");
                    return allocation;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes consumed so far, padding included. Only a snapshot while other
    /// threads are allocating.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }
}

impl RegionAllocator for LockFreeBumpAllocator<'_> {
    #[inline]
    fn default_alignment(&self) -> usize {
        bump::DEFAULT_ALIGNMENT
    }

    #[inline]
    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> MemoryRegion {
        LockFreeBumpAllocator::allocate_aligned(self, size, alignment)
    }

    unsafe fn free(&mut self, _address: usize) {}

    fn reset(&mut self) {
        let offset = self.offset.get_mut();
        debug!("lock-free bump: reset after using {offset} bytes");
        *offset = 0;
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}

/// [`crate::ChunkPoolAllocator`] whose free list head is an atomic, so chunks
/// can be popped from many threads at once. Every free chunk stores the offset
/// of the next one in its first word, which is read atomically because a
/// racing thread may be popping the same chunk:
///
/// ```text
///   head (atomic)
///     |
///     v
///   +-------+        +-------+        +-------+
///   | next -+------> | next -+------> |  NIL  |
///   +-------+        +-------+        +-------+
/// ```
///
/// Pushing chunks back requires `&mut self`, which rules out the ABA problem:
/// while anybody can pop, a chunk can't come back to the head.
pub struct LockFreeChunkPoolAllocator<'buf> {
    backing: Backing<'buf>,
    geometry: Geometry,
    head: CachePadded<AtomicUsize>,
}

impl<'buf> LockFreeChunkPoolAllocator<'buf> {
    /// Builds a pool of `chunk_size` byte chunks. Alignment is raised to at
    /// least that of `usize` so that free list links can be atomics.
    pub fn try_new(
        backing: impl Into<Backing<'buf>>,
        chunk_size: usize,
        chunk_alignment: usize,
    ) -> Result<Self> {
        let backing = backing.into();

        if !is_power_of_two(chunk_alignment) {
            return Err(RegionError::InvalidAlignment {
                alignment: chunk_alignment,
            });
        }

        let alignment = chunk_alignment.max(mem::align_of::<AtomicUsize>());
        let geometry = Geometry::new(&backing, chunk_size, alignment)?;

        let mut pool = Self {
            backing,
            geometry,
            head: CachePadded::new(AtomicUsize::new(Link::NIL.into_raw())),
        };
        pool.thread_chunks();

        Ok(pool)
    }

    /// Same as [`LockFreeChunkPoolAllocator::try_new`] but panics on invalid
    /// input.
    #[track_caller]
    pub fn new(backing: impl Into<Backing<'buf>>, chunk_size: usize, chunk_alignment: usize) -> Self {
        or_panic(Self::try_new(backing, chunk_size, chunk_alignment))
    }

    /// Total number of chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.geometry.chunk_count
    }

    /// Pops one chunk. Safe to call from many threads at once.
    ///
    /// This is a Treiber stack pop, with the known caveat of that design: a
    /// thread that loses the race may still be reading the link word of the
    /// chunk it wanted while the winner's caller already writes to it. The
    /// value read is thrown away because the exchange fails, but the read
    /// itself races with a non-atomic write. Callers that can't accept that
    /// should write to the first word of a chunk only through atomics, or use
    /// [`crate::ChunkPoolAllocator`] behind [`crate::Synchronized`].
    pub fn allocate(&self) -> MemoryRegion {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let Some(chunk) = Link::from_raw(head).get() else {
                return MemoryRegion::NULL;
            };

            // Stale if another thread wins this chunk, then the exchange fails.
            let next = self.backing.atomic_link(chunk).load(Ordering::Relaxed);

            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let allocation = self.backing.region_at(chunk, self.geometry.chunk_size);
                    trace!("lock-free pool: allocated {allocation:?}");
                    return allocation;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Links every chunk, lowest address at the head.
    fn thread_chunks(&mut self) {
        let mut head = Link::NIL.into_raw();

        for index in (0..self.geometry.chunk_count).rev() {
            let chunk = self.geometry.chunk(index);
            self.backing.atomic_link(chunk).store(head, Ordering::Relaxed);
            head = chunk;
        }

        *self.head.get_mut() = head;
    }
}

impl ChunkAllocator for LockFreeChunkPoolAllocator<'_> {
    #[inline]
    fn chunk_size(&self) -> usize {
        self.geometry.chunk_size
    }

    #[inline]
    fn allocate(&mut self) -> MemoryRegion {
        LockFreeChunkPoolAllocator::allocate(self)
    }

    /// # Panics
    ///
    /// If `address` is not the start of a chunk of this pool. Unlike
    /// [`crate::ChunkPoolAllocator`], this pool keeps no count of free chunks
    /// and can't detect double frees.
    unsafe fn free(&mut self, address: usize) {
        if address == 0 {
            return;
        }

        assert!(
            self.backing.contains(address),
            "lock-free pool: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        let chunk = self.backing.offset_of(address);
        self.geometry.check_chunk(chunk);

        let head = self.head.get_mut();
        self.backing.atomic_link(chunk).store(*head, Ordering::Relaxed);
        *head = chunk;

        trace!("lock-free pool: freed {address:#x}");
    }

    fn reset(&mut self) {
        debug!("lock-free pool: reset {} chunks", self.geometry.chunk_count);
        self.thread_chunks();
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}
