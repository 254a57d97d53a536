use core::{
    alloc::{GlobalAlloc, Layout},
    hint,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use lock_api::{GuardSend, Mutex, MutexGuard, RawMutex};

use crate::allocator::RegionAllocator;

/// Minimal spin lock. Works without an operating system, which is all the
/// allocators of this crate assume.
pub struct RawSpinlock(AtomicBool);

unsafe impl RawMutex for RawSpinlock {
    const INIT: RawSpinlock = RawSpinlock(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wraps any [`RegionAllocator`] in a spin lock so it can be shared between
/// threads. Every call takes the lock, so this is the external lock the
/// single writer allocators need, not a scalable allocator.
///
/// It also implements [`GlobalAlloc`], so an allocator over a `'static`
/// buffer can serve as the global allocator of a program:
///
/// ```rust,ignore
/// static mut HEAP: [u8; 1 << 20] = [0; 1 << 20];
///
/// #[global_allocator]
/// static ALLOCATOR: Synchronized<BestFitAllocator<'static>> =
///     Synchronized::new(/* built over HEAP at startup */);
/// ```
pub struct Synchronized<A> {
    allocator: Mutex<RawSpinlock, A>,
}

impl<A> Synchronized<A> {
    pub const fn new(allocator: A) -> Self {
        Self {
            allocator: Mutex::new(allocator),
        }
    }

    /// Gives exclusive access to the allocator until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, RawSpinlock, A> {
        self.allocator.lock()
    }

    pub fn into_inner(self) -> A {
        self.allocator.into_inner()
    }
}

unsafe impl<A: RegionAllocator + Send> GlobalAlloc for Synchronized<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let allocation = self.lock().allocate_aligned(layout.size(), layout.align());

        match allocation.ok() {
            Some(region) => region.as_mut_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        unsafe { self.lock().free(address as usize) }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Barrier,
        thread::{self, ThreadId},
    };

    use super::*;
    use crate::{align::kib, pages::Pages, BestFitAllocator, FirstFitAllocator};

    #[test]
    fn spinlock_excludes() {
        let lock = RawSpinlock::INIT;

        assert!(lock.try_lock());
        assert!(!lock.try_lock());

        unsafe { lock.unlock() };
        assert!(lock.try_lock());
    }

    #[test_log::test]
    fn multiple_threads_allocs_and_deallocs() {
        let mut pages = Pages::new(kib(64));
        let allocator = Synchronized::new(BestFitAllocator::new(pages.as_mut_slice()));

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let num_elements = 256;
                    let layout = Layout::array::<ThreadId>(num_elements).unwrap();
                    let address = allocator.alloc(layout).cast::<ThreadId>();
                    assert!(!address.is_null());
                    assert!(address.is_aligned());

                    let id = thread::current().id();
                    for i in 0..num_elements {
                        *address.add(i) = id;
                    }

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_elements {
                        assert_eq!(*address.add(i), id);
                    }

                    allocator.dealloc(address.cast(), layout);
                });
            }
        });

        let allocator = allocator.into_inner();
        allocator.validate().unwrap();
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.free_blocks().count(), 1);
    }

    #[test]
    fn interleaved_allocs_and_deallocs() {
        let mut pages = Pages::new(kib(64));
        let allocator = Synchronized::new(FirstFitAllocator::new(pages.as_mut_slice()));

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| unsafe {
                    for size in [16, 256, 1024, 2048] {
                        for _ in 0..100 {
                            let layout = Layout::from_size_align(size, 16).unwrap();
                            let address = allocator.alloc(layout);
                            assert!(!address.is_null());

                            for i in 0..size {
                                *address.add(i) = (i % 256) as u8;
                            }
                            for i in 0..size {
                                assert_eq!(*address.add(i), (i % 256) as u8);
                            }

                            allocator.dealloc(address, layout);
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.lock().used(), 0);
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut pages = Pages::new(kib(4));
        let allocator = Synchronized::new(FirstFitAllocator::new(pages.as_mut_slice()));

        unsafe {
            assert!(allocator.alloc(Layout::from_size_align(kib(8), 8).unwrap()).is_null());
        }
    }
}
