use core::fmt;

use log::{debug, trace};

use crate::{
    align::{compute_padding, is_power_of_two},
    allocator::RegionAllocator,
    backing::{Backing, Link},
    errors::{or_panic, RegionError, Result},
    header::{AllocationHeader, ALLOCATION_HEADER_SIZE},
    list::AddressList,
    rbtree::{FreeNode, RbTree, NODE_SIZE},
    region::MemoryRegion,
};

/// Requested alignments below this are raised to it.
pub const MIN_ALIGNMENT: usize = 8;

/// Free list allocator with best fit search. Every free block is indexed
/// twice by the same in-band [`FreeNode`]:
///
/// - A red-black tree ordered by size (then address) finds the smallest
/// block that fits a request in O(log n).
///
/// - A doubly linked list ordered by address finds the physical neighbours
/// of a block, so freed blocks merge with adjacent free blocks.
///
/// ```text
///                   tree                         list
///
///                  +-----+
///                  | 256 |           head -> [ 0: 512 ] <-> [ 700: 128 ]
///                  +-----+                       <-> [ 1024: 256 ] <-> ...
///                 /       \
///            +-----+     +-----+
///            | 128 |     | 512 |
///            +-----+     +-----+
/// ```
///
/// Allocated blocks carry an [`AllocationHeader`] just like
/// [`crate::FirstFitAllocator`], and blocks are never smaller than a
/// [`FreeNode`] so any of them can go back into both structures.
pub struct BestFitAllocator<'buf> {
    backing: Backing<'buf>,
    tree: RbTree,
    list: AddressList,
    /// Bytes in allocated blocks, headers and padding included.
    used: usize,
}

impl<'buf> BestFitAllocator<'buf> {
    /// Builds an allocator over `backing`.
    pub fn try_new(backing: impl Into<Backing<'buf>>) -> Result<Self> {
        let backing = backing.into();

        if backing.is_empty() {
            return Err(RegionError::NullRegion);
        }

        if backing.len() < NODE_SIZE {
            return Err(RegionError::RegionTooSmall {
                size: backing.len(),
                minimum: NODE_SIZE,
            });
        }

        let mut allocator = Self {
            backing,
            tree: RbTree::new(),
            list: AddressList::new(),
            used: 0,
        };
        allocator.reset();

        Ok(allocator)
    }

    /// Same as [`BestFitAllocator::try_new`] but panics on invalid input.
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
        self.list.iter(&self.backing).map(|at| {
            let node = FreeNode::load(&self.backing, at);
            self.backing.region_at(at, node.size())
        })
    }

    /// Checks every invariant of the free block index: red-black properties
    /// and ordering of the tree, link consistency and address order of the
    /// list, both holding the same blocks, and no two free blocks touching.
    pub fn validate(&self) -> Result<()> {
        let in_tree = self.tree.validate(&self.backing)?;
        let in_list = self.list.validate(&self.backing)?;

        if in_tree != in_list {
            return Err(RegionError::Corrupted("tree and address list hold different blocks"));
        }

        let mut previous_end = None;
        for block in self.free_blocks() {
            if previous_end == Some(block.address) {
                return Err(RegionError::Corrupted("adjacent free blocks weren't merged"));
            }
            previous_end = Some(block.end());
        }

        Ok(())
    }

    /// Renders the size tree, one node per line, right subtree first.
    /// Nodes are printed as `R size` or `B size` depending on their color.
    pub fn dump_tree(&self) -> impl fmt::Display + '_ {
        self.tree.dump(&self.backing)
    }

    /// Adds a free block to both indexes, right after `previous` in the list.
    fn insert_free_block(&mut self, previous: Link, at: usize, size: usize) {
        self.backing.write(at, FreeNode::new(size));
        self.list.insert_after(&mut self.backing, previous, at);
        self.tree.insert(&mut self.backing, at);
    }
}

impl RegionAllocator for BestFitAllocator<'_> {
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
        let base = self.backing.address();
        let padding_at =
            |offset: usize| compute_padding(base + offset, alignment, ALLOCATION_HEADER_SIZE);

        // Padding is never below the header size, so smaller nodes can't fit.
        // Nodes of `size + ALLOCATION_HEADER_SIZE + alignment` bytes or more
        // always fit, which bounds the walk.
        let found = self.tree.best_fit(
            &self.backing,
            size + ALLOCATION_HEADER_SIZE,
            |offset, node_size| node_size >= padding_at(offset) + size,
        );

        let Some(offset) = found else {
            return MemoryRegion::NULL;
        };

        let node = FreeNode::load(&self.backing, offset);
        let padding = padding_at(offset);
        // Whatever we hand out has to be able to hold a node once it's freed.
        let required = (padding + size).max(NODE_SIZE);
        let remaining = node.size() - required;

        self.tree.remove(&mut self.backing, offset);

        let block_size = if remaining > NODE_SIZE {
            self.insert_free_block(Link::to(offset), offset + required, remaining);
            required
        } else {
            node.size()
        };

        self.list.unlink(&mut self.backing, offset);

        let content = offset + padding;
        AllocationHeader {
            block_size,
            padding,
        }
        .write_before(&mut self.backing, content);

        self.used += block_size;

        let allocation = self.backing.region_at(content, block_size - padding);
        trace!("best fit: allocated {allocation:?} from block at {offset}");

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
            "best fit: free of {address:#x} outside of {:?}",
            self.backing.region()
        );

        assert!(
            !self.free_blocks().any(|free| free.contains(address)),
            "best fit: double free of {address:#x}"
        );

        let content = self.backing.offset_of(address);
        let header = AllocationHeader::read_before(&self.backing, content);
        let block = header.block_start(content);
        let mut size = header.block_size;

        let (previous, next) = self.list.neighbours(&self.backing, block);

        let previous_node = previous.get().map(|at| (at, FreeNode::load(&self.backing, at)));

        assert!(
            previous_node.is_none_or(|(at, node)| at + node.size() <= block)
                && next.get().is_none_or(|at| block + size <= at),
            "best fit: double free of {address:#x}"
        );

        self.used -= header.block_size;
        trace!("best fit: freed block of {size} bytes at {block}");

        if let Some(next_at) = next.get().filter(|at| block + size == *at) {
            let next_node = FreeNode::load(&self.backing, next_at);
            self.tree.remove(&mut self.backing, next_at);
            self.list.unlink(&mut self.backing, next_at);
            size += next_node.size();
            debug!("best fit: merged freed block at {block} with next block at {next_at}");
        }

        match previous_node {
            Some((previous_at, node)) if previous_at + node.size() == block => {
                self.tree.remove(&mut self.backing, previous_at);
                FreeNode::update(&mut self.backing, previous_at, |node| {
                    node.set_size(node.size() + size);
                });
                self.tree.insert(&mut self.backing, previous_at);
                debug!("best fit: merged freed block at {block} into previous block at {previous_at}");
            }
            _ => self.insert_free_block(previous, block, size),
        }
    }

    fn reset(&mut self) {
        debug!("best fit: reset with {} bytes in use", self.used);

        let size = self.backing.len();
        self.tree.clear();
        self.list.clear();

        self.backing.write(0, FreeNode::new(size));
        self.list.insert(&mut self.backing, 0);
        self.tree.insert(&mut self.backing, 0);
        self.used = 0;
    }

    #[inline]
    fn region(&self) -> MemoryRegion {
        self.backing.region()
    }
}
