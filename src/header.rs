use core::mem;

use crate::backing::{Backing, Pod};

/// Header of an allocated block in the free list allocators. It's written
/// right before the address given to the caller, so on free we can find out
/// where the block actually started and how large it was:
///
/// ```text
///   block start                               content
///        |                                       |
///        v                                       v
///        +-------------+-----------------------+--------------------------+
///        | unused      |   AllocationHeader    |  Content                 |
///        +-------------+-----------------------+--------------------------+
///        <---------------- padding ------------>
///        <-------------------------- block_size ------------------------->
/// ```
///
/// `padding` always includes the header itself, see
/// [`crate::align::compute_padding`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationHeader {
    /// Whole block, padding and header included.
    pub block_size: usize,
    /// Distance from the block start to the content.
    pub padding: usize,
}

unsafe impl Pod for AllocationHeader {}

/// Allocation header size in bytes.
pub(crate) const ALLOCATION_HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

impl AllocationHeader {
    /// Offset of the block whose content starts at `content`.
    #[inline]
    pub fn block_start(&self, content: usize) -> usize {
        content - self.padding
    }

    /// Writes the header right before `content`.
    #[inline]
    pub fn write_before(self, backing: &mut Backing, content: usize) {
        backing.write(content - ALLOCATION_HEADER_SIZE, self);
    }

    /// Reads the header that precedes `content` and checks that it describes
    /// a block inside `backing`.
    ///
    /// # Panics
    ///
    /// If `content` can't possibly be the start of an allocation. Catches
    /// most foreign addresses and interior pointers.
    #[track_caller]
    pub fn read_before(backing: &Backing, content: usize) -> Self {
        assert!(
            content >= ALLOCATION_HEADER_SIZE,
            "address at offset {content} is not the start of an allocation"
        );

        let header: Self = backing.read(content - ALLOCATION_HEADER_SIZE);

        let valid = header.padding >= ALLOCATION_HEADER_SIZE
            && header.padding <= content
            && header.block_size > header.padding
            && header.block_size <= backing.len() - header.block_start(content);

        assert!(
            valid,
            "address at offset {content} is not the start of an allocation: {header:?}"
        );

        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_before_content() {
        let mut buffer = [0u8; 128];
        let mut backing = Backing::from(&mut buffer);

        let header = AllocationHeader {
            block_size: 64,
            padding: 24,
        };

        header.write_before(&mut backing, 40);

        let read = AllocationHeader::read_before(&backing, 40);
        assert_eq!(read, header);
        assert_eq!(read.block_start(40), 16);
    }

    #[test]
    #[should_panic(expected = "not the start of an allocation")]
    fn garbage_header() {
        let mut buffer = [0xffu8; 128];
        let backing = Backing::from(&mut buffer);

        AllocationHeader::read_before(&backing, 64);
    }
}
