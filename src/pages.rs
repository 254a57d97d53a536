//! Test buffers. Allocators under test get whole pages straight from the
//! kernel, so base addresses are page aligned (buddy regions need that) and
//! memory errors show up as segfaults instead of corrupting the test harness
//! heap.

use std::{ptr::NonNull, slice};

/// Anonymous memory mapping that is unmapped when dropped.
pub(crate) struct Pages {
    address: NonNull<u8>,
    length: usize,
}

impl Pages {
    /// Maps at least `length` bytes, rounded up to a whole number of pages.
    pub fn new(length: usize) -> Self {
        let length = crate::align::align_up(length.max(1), PAGE_SIZE);
        let address = unsafe { platform::request_memory(length) }
            .unwrap_or_else(|| panic!("couldn't map {length} bytes for a test"));

        Self { address, length }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: The mapping lives as long as self and is only reachable
        // through this borrow.
        unsafe { slice::from_raw_parts_mut(self.address.as_ptr(), self.length) }
    }

    pub fn address(&self) -> usize {
        self.address.as_ptr() as usize
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        unsafe { platform::return_memory(self.address, self.length) }
    }
}

/// Tests assume 4 KiB pages. Larger kernel pages still satisfy the alignment
/// because `mmap` returns addresses aligned to the real page size.
pub(crate) const PAGE_SIZE: usize = 4096;

#[cfg(not(miri))]
mod platform {
    use std::ptr::{self, NonNull};

    pub unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = libc::PROT_READ | libc::PROT_WRITE;

        // Private to our process and not mapped to any file.
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match unsafe { libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) } {
            libc::MAP_FAILED => None,
            address => NonNull::new(address.cast()),
        }
    }

    pub unsafe fn return_memory(address: NonNull<u8>, length: usize) {
        let result = unsafe { libc::munmap(address.as_ptr().cast(), length) };
        debug_assert_eq!(result, 0, "munmap failed");
    }
}

#[cfg(miri)]
mod platform {
    //! Miri has no FFI support, so use the global allocator with page
    //! alignment instead of `mmap`.

    use std::{alloc, ptr::NonNull};

    use super::PAGE_SIZE;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap()
    }

    pub unsafe fn request_memory(length: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { alloc::alloc_zeroed(to_layout(length)) })
    }

    pub unsafe fn return_memory(address: NonNull<u8>, length: usize) {
        unsafe { alloc::dealloc(address.as_ptr(), to_layout(length)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_aligned_and_writable() {
        let mut pages = Pages::new(PAGE_SIZE + 1);
        assert_eq!(pages.address() % PAGE_SIZE, 0);

        let bytes = pages.as_mut_slice();
        assert_eq!(bytes.len(), 2 * PAGE_SIZE);

        bytes.fill(0xab);
        assert!(bytes.iter().all(|byte| *byte == 0xab));
    }
}
