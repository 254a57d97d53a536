//! Every allocator in this crate stores its bookkeeping inside the memory it
//! manages: stack headers, free list nodes, red-black tree nodes and so on.
//! This module is the only place where those bytes get reinterpreted as
//! typed values. Allocators talk in terms of offsets relative to the start of
//! the managed memory and let [`Backing`] do bounds checking and the actual
//! reads and writes:
//!
//! ```text
//!   base                                                       base + len
//!    |                                                              |
//!    v                                                              v
//!    +--------+------------------+--------+-------------------------+
//!    | header |     content      | header |         content         |
//!    +--------+------------------+--------+-------------------------+
//!    ^                           ^
//!    |                           |
//!    +-- offset 0                +-- offset N, read::<Header>(N)
//! ```
//!
//! Headers are read and written unaligned because nothing guarantees that a
//! caller-chosen padding leaves them on a natural boundary. Types stored this
//! way must be [`Pod`].

use core::{
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::AtomicUsize,
};

use crate::{align::address_to_ptr, region::MemoryRegion};

/// Plain old data. Any bit pattern written by this crate can be read back as
/// the same type without invoking undefined behaviour.
///
/// # Safety
///
/// Implementors must be `Copy`, have no padding that matters, no references
/// and no invalid bit patterns among those the crate writes.
pub(crate) unsafe trait Pod: Copy {}

unsafe impl Pod for usize {}

/// Position of an in-band node relative to the start of the backing memory.
/// Intrusive lists and trees link offsets instead of pointers, so a node is
/// just "the bytes at this offset" and there's nothing that can dangle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct Link(usize);

unsafe impl Pod for Link {}

impl Link {
    /// Points nowhere. Plays the role of null pointers and of the sentinel
    /// node in the red-black tree.
    pub const NIL: Self = Self(usize::MAX);

    #[inline]
    pub const fn to(offset: usize) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == usize::MAX
    }

    /// Offset this link points to.
    ///
    /// # Panics
    ///
    /// On [`Link::NIL`]. Following a null link means the structure is broken.
    #[inline]
    #[track_caller]
    pub fn offset(self) -> usize {
        assert!(!self.is_nil(), "attempt to follow a nil link");
        self.0
    }

    #[inline]
    pub const fn get(self) -> Option<usize> {
        if self.is_nil() {
            None
        } else {
            Some(self.0)
        }
    }

    /// Raw representation, used by the lock-free pool to store links in
    /// atomics.
    #[inline]
    pub const fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

/// Memory handed to an allocator. Conceptually this is a `&'buf mut [u8]`:
/// the allocator has exclusive access to it for as long as it lives.
///
/// There are two ways to get one:
///
/// - From a mutable byte slice, which is completely safe:
///
/// ```rust
/// use regionalloc::{Backing, BumpAllocator, RegionAllocator};
///
/// let mut buffer = [0u8; 256];
/// let mut bump = BumpAllocator::new(&mut buffer[..]);
///
/// assert!(!bump.allocate(64).is_null());
/// ```
///
/// - From a raw [`MemoryRegion`] with [`Backing::from_region`], for memory
/// obtained elsewhere (linker sections, `mmap`, another allocator).
pub struct Backing<'buf> {
    base: NonNull<u8>,
    len: usize,
    marker: PhantomData<&'buf mut [u8]>,
}

// Backing is semantically a unique borrow of a byte slice.
unsafe impl Send for Backing<'_> {}
unsafe impl Sync for Backing<'_> {}

impl<'buf> From<&'buf mut [u8]> for Backing<'buf> {
    fn from(slice: &'buf mut [u8]) -> Self {
        Self {
            len: slice.len(),
            base: NonNull::from(slice).cast(),
            marker: PhantomData,
        }
    }
}

impl<'buf, const N: usize> From<&'buf mut [u8; N]> for Backing<'buf> {
    fn from(array: &'buf mut [u8; N]) -> Self {
        Self::from(&mut array[..])
    }
}

impl<'buf> Backing<'buf> {
    /// Takes over the memory described by `region`. A null region produces an
    /// empty backing, which every allocator constructor rejects.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `'buf` and nothing else
    /// may access it during that time.
    pub unsafe fn from_region(region: MemoryRegion) -> Self {
        match NonNull::new(address_to_ptr(region.address)) {
            Some(base) => Self {
                base,
                len: region.size,
                marker: PhantomData,
            },
            None => Self {
                base: NonNull::dangling(),
                len: 0,
                marker: PhantomData,
            },
        }
    }

    /// Start address.
    #[inline]
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole extent as a [`MemoryRegion`].
    #[inline]
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.address(), self.len)
    }

    /// Whether `address` points inside this memory.
    #[inline]
    pub(crate) fn contains(&self, address: usize) -> bool {
        self.region().contains(address)
    }

    /// Absolute address of `offset`.
    #[inline]
    pub(crate) fn address_at(&self, offset: usize) -> usize {
        self.address() + offset
    }

    /// Offset of `address`. The address may be one past the end.
    #[inline]
    #[track_caller]
    pub(crate) fn offset_of(&self, address: usize) -> usize {
        debug_assert!(
            address >= self.address() && address <= self.address() + self.len,
            "address {address:#x} is outside of {:?}",
            self.region()
        );
        address - self.address()
    }

    /// Allocation result for `size` bytes starting at `offset`.
    #[inline]
    pub(crate) fn region_at(&self, offset: usize, size: usize) -> MemoryRegion {
        MemoryRegion::new(self.address_at(offset), size)
    }

    #[inline]
    #[track_caller]
    fn check_bounds(&self, offset: usize, length: usize) {
        assert!(
            offset.checked_add(length).is_some_and(|end| end <= self.len),
            "access to {length} bytes at offset {offset} is out of bounds ({} bytes)",
            self.len
        );
    }

    /// Reads a `T` stored at `offset`.
    #[inline]
    #[track_caller]
    pub(crate) fn read<T: Pod>(&self, offset: usize) -> T {
        self.check_bounds(offset, mem::size_of::<T>());
        // SAFETY: In bounds, memory is valid for 'buf and T is Pod.
        unsafe { ptr::read_unaligned(self.base.as_ptr().add(offset).cast()) }
    }

    /// Writes `value` at `offset`.
    #[inline]
    #[track_caller]
    pub(crate) fn write<T: Pod>(&mut self, offset: usize, value: T) {
        self.check_bounds(offset, mem::size_of::<T>());
        // SAFETY: In bounds and we have exclusive access.
        unsafe { ptr::write_unaligned(self.base.as_ptr().add(offset).cast(), value) }
    }

    /// Fills `length` bytes at `offset` with zeroes.
    #[inline]
    #[track_caller]
    pub(crate) fn zero(&mut self, offset: usize, length: usize) {
        self.check_bounds(offset, length);
        // SAFETY: Same as write.
        unsafe { crate::align::zero_memory(self.base.as_ptr().add(offset), length) }
    }

    /// Views the word at `offset` as an atomic. Used for free list links that
    /// can be read by a thread while another thread pops the same node.
    ///
    /// # Panics
    ///
    /// If the address is not aligned for [`AtomicUsize`].
    #[inline]
    #[track_caller]
    pub(crate) fn atomic_link(&self, offset: usize) -> &AtomicUsize {
        self.check_bounds(offset, mem::size_of::<AtomicUsize>());
        let pointer = unsafe { self.base.as_ptr().add(offset) };
        assert!(
            pointer.cast::<AtomicUsize>().is_aligned(),
            "atomic link at offset {offset} is misaligned"
        );
        // SAFETY: In bounds, aligned, and every access to this word while the
        // node is free goes through this atomic view.
        unsafe { AtomicUsize::from_ptr(pointer.cast()) }
    }
}

impl core::fmt::Debug for Backing<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backing")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .finish()
    }
}
