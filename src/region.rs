use core::{cmp::Ordering, fmt, slice};

use crate::align::address_to_ptr;

/// Contiguous extent of memory described by its start address and length in
/// bytes. The same type is used to describe the memory an allocator manages
/// and the pieces that allocators hand out:
///
/// ```text
///  region.address                                   region.end()
///        |                                                |
///        v                                                v
///        +-------------+--------------+-------------------+
///        |   granted   |   granted    |       free        |
///        +-------------+--------------+-------------------+
///        ^             ^
///        |             |
///        +-- allocation.address (allocation.size bytes)
/// ```
///
/// Allocators never return errors for running out of space, they return
/// [`MemoryRegion::NULL`] instead. No valid allocation can ever be null
/// because its address is always non-zero.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    pub address: usize,
    pub size: usize,
}

impl MemoryRegion {
    /// The "no region" value. Returned on allocation failure.
    pub const NULL: Self = Self {
        address: 0,
        size: 0,
    };

    #[inline]
    pub const fn new(address: usize, size: usize) -> Self {
        Self { address, size }
    }

    /// Describes the memory behind `slice`.
    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        Self::new(slice.as_ptr() as usize, slice.len())
    }

    /// `true` if this is [`MemoryRegion::NULL`].
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.address == 0 && self.size == 0
    }

    /// First address past the region.
    #[inline]
    pub const fn end(&self) -> usize {
        self.address + self.size
    }

    /// Whether `address` falls inside `[self.address, self.end())`.
    #[inline]
    pub const fn contains(&self, address: usize) -> bool {
        address >= self.address && address < self.end()
    }

    /// Whether both regions share at least one byte. Empty regions never
    /// overlap anything.
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.size != 0 && other.size != 0 && self.address < other.end() && other.address < self.end()
    }

    /// Converts the sentinel into an [`Option`] so callers can use `?` and
    /// combinators instead of comparing against [`MemoryRegion::NULL`].
    #[inline]
    pub const fn ok(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        address_to_ptr(self.address)
    }

    /// Borrows the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for `'a` and nothing else
    /// may access it in the meantime. Allocations returned by this crate
    /// satisfy that until they are freed or their allocator is reset.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        debug_assert!(!self.is_null(), "null regions can't be dereferenced");
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) }
    }
}

impl PartialOrd for MemoryRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Regions sort by address. Size only breaks ties so that the ordering agrees
/// with [`Eq`].
impl Ord for MemoryRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.size.cmp(&other.size))
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("MemoryRegion(NULL)")
        } else {
            write!(f, "MemoryRegion({:#x}, {} bytes)", self.address, self.size)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    #[test]
    fn null_region() {
        assert!(MemoryRegion::NULL.is_null());
        assert!(MemoryRegion::default().is_null());
        assert_eq!(MemoryRegion::NULL.ok(), None);

        // Zero sized but with an address is not the sentinel.
        assert!(!MemoryRegion::new(0x1000, 0).is_null());

        let region = MemoryRegion::new(0x1000, 64);
        assert_eq!(region.ok(), Some(region));
    }

    #[test]
    fn bounds() {
        let region = MemoryRegion::new(0x4_0000, 0x100);

        assert_eq!(region.end(), 0x4_0100);
        assert!(region.contains(0x4_0000));
        assert!(region.contains(0x4_00ff));
        assert!(!region.contains(0x4_0100));
        assert!(!region.contains(0x3_ffff));
    }

    #[test]
    fn overlapping() {
        let a = MemoryRegion::new(0x1000, 0x100);
        let b = MemoryRegion::new(0x1080, 0x100);
        let c = MemoryRegion::new(0x1100, 0x10);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&MemoryRegion::new(0x1010, 0)));
    }

    #[test]
    fn ordering_by_address() {
        let mut regions = Vec::from([
            MemoryRegion::new(0x3000, 16),
            MemoryRegion::new(0x1000, 64),
            MemoryRegion::new(0x2000, 32),
            MemoryRegion::new(0x1000, 8),
        ]);

        regions.sort();

        let addresses: Vec<_> = regions.iter().map(|r| r.address).collect();
        assert_eq!(addresses, [0x1000, 0x1000, 0x2000, 0x3000]);
        assert_eq!(regions[0].size, 8);
        assert_ne!(regions[0], regions[1]);
    }

    #[test]
    fn slices() {
        let mut buffer = [7u8; 32];
        let region = MemoryRegion::from_slice(&buffer);

        assert_eq!(region.size, 32);
        assert_eq!(region.as_mut_ptr(), buffer.as_mut_ptr());

        unsafe {
            // Buffer outlives the slice and isn't touched while it's alive.
            let bytes = region.as_mut_slice();
            bytes[0] = 1;
        }

        assert_eq!(buffer[0], 1);
    }
}
