//! Memory allocators that never ask anybody for memory. Each one is built over
//! a buffer supplied by the caller and partitions it under its own policy:
//!
//! - [`BumpAllocator`]: moves an offset forward, frees everything at once.
//! - [`StackAllocator`]: like bump, but allocations can be freed in LIFO
//! order.
//! - [`ChunkPoolAllocator`]: fixed size chunks, O(1) allocate and free.
//! - [`BuddyAllocator`]: power of two blocks that split and merge.
//! - [`FirstFitAllocator`]: address ordered free list, first block that fits.
//! - [`BestFitAllocator`]: free blocks indexed by a red-black tree, smallest
//! block that fits.
//! - [`LockFreeBumpAllocator`] and [`LockFreeChunkPoolAllocator`]: allocation
//! from many threads at once through compare and swap loops.
//!
//! All bookkeeping lives inside the buffer itself, in headers placed before
//! allocations or in the free blocks. Running out of memory is not an error,
//! allocators return [`MemoryRegion::NULL`]:
//!
//! ```rust
//! use regionalloc::{BumpAllocator, MemoryRegion, RegionAllocator};
//!
//! let mut buffer = [0u8; 256];
//! let mut allocator = BumpAllocator::new(&mut buffer);
//!
//! let region = allocator.allocate(100);
//! assert_eq!(region.size, 100);
//! assert_eq!(allocator.allocate(200), MemoryRegion::NULL);
//!
//! allocator.reset();
//! assert!(!allocator.allocate(200).is_null());
//! ```
//!
//! The crate doesn't use `std`, only `core`. Logs go through the [`log`]
//! facade, install a logger to see them.

#![cfg_attr(not(test), no_std)]

pub mod align;
mod allocator;
mod backing;
pub mod best_fit;
pub mod buddy;
pub mod bump;
mod errors;
pub mod first_fit;
mod header;
mod list;
pub mod lockfree;
pub mod pool;
mod rbtree;
mod region;
pub mod stack;
mod sync;

#[cfg(test)]
mod pages;

pub use allocator::{ChunkAllocator, RegionAllocator};
pub use backing::Backing;
pub use best_fit::BestFitAllocator;
pub use buddy::{BuddyAllocator, BuddyBlock};
pub use bump::{ArenaAllocator, BumpAllocator};
pub use errors::{RegionError, Result};
pub use first_fit::FirstFitAllocator;
pub use lockfree::{LockFreeBumpAllocator, LockFreeChunkPoolAllocator};
pub use pool::{BlockAllocator, ChunkPoolAllocator};
pub use region::MemoryRegion;
pub use stack::StackAllocator;
pub use sync::{RawSpinlock, Synchronized};
