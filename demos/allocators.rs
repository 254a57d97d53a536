//! Walks through every allocator over the same kind of buffer. Run with
//! `RUST_LOG=trace` to see what each one does internally.

use std::{alloc::GlobalAlloc, alloc::Layout, thread};

use regionalloc::{
    align::kib, BestFitAllocator, BuddyAllocator, BumpAllocator, ChunkAllocator,
    ChunkPoolAllocator, FirstFitAllocator, LockFreeBumpAllocator, MemoryRegion, RegionAllocator,
    StackAllocator, Synchronized,
};

/// Heap buffer aligned to its own size, buddy allocators need that.
#[repr(C, align(4096))]
struct Buffer([u8; 4096]);

fn buffer() -> Box<Buffer> {
    Box::new(Buffer([0; 4096]))
}

fn show(name: &str, region: MemoryRegion, base: MemoryRegion) {
    if region.is_null() {
        println!("{name:>12}: NULL");
    } else {
        println!(
            "{name:>12}: offset {:>5}, {:>5} bytes",
            region.address - base.address,
            region.size
        );
    }
}

fn bump() {
    println!("Bump");
    let mut memory = buffer();
    let mut allocator = BumpAllocator::new(&mut memory.0);
    let base = allocator.region();

    show("u32", allocator.allocate(4), base);
    show("[u8; 12]", allocator.allocate(12), base);
    show("page", allocator.allocate(4096), base);

    allocator.reset();
    show("after reset", allocator.allocate(4096), base);
}

fn stack() {
    println!("Stack");
    let mut memory = buffer();
    let mut allocator = StackAllocator::new(&mut memory.0);
    let base = allocator.region();

    let first = allocator.allocate(100);
    let second = allocator.allocate_aligned(100, 64);
    show("first", first, base);
    show("second", second, base);

    unsafe {
        allocator.free(second.address);
        allocator.free(first.address);
    }
    show("reused", allocator.allocate(100), base);
}

fn pool() {
    println!("Pool");
    let mut memory = buffer();
    let mut pool = ChunkPoolAllocator::new(&mut memory.0, 256, 16);
    let base = pool.region();

    println!("{:>12}: {}", "chunks", pool.chunk_count());
    let a = pool.allocate();
    let b = pool.allocate();
    show("a", a, base);
    show("b", b, base);

    unsafe { pool.free(a.address) };
    show("reused", pool.allocate(), base);
}

fn buddy() {
    println!("Buddy");
    let mut memory = buffer();
    let mut allocator = BuddyAllocator::new(&mut memory.0);
    let base = allocator.region();

    let small = allocator.allocate(100);
    let large = allocator.allocate(1000);
    show("small", small, base);
    show("large", large, base);

    for block in allocator.blocks() {
        println!(
            "{:>12}  [{:>5}, {:>5}) {}",
            "",
            block.region.address - base.address,
            block.region.end() - base.address,
            if block.free { "free" } else { "used" }
        );
    }

    unsafe {
        allocator.free(small.address);
        allocator.free(large.address);
    }
    println!("{:>12}: {} merges", "coalesce", allocator.coalesce());
}

fn free_lists() {
    println!("First fit");
    let mut memory = buffer();
    let mut allocator = FirstFitAllocator::new(&mut memory.0);
    let base = allocator.region();

    let blocks: Vec<_> = [1024, 128, 512].map(|size| allocator.allocate(size)).into();
    unsafe { allocator.free(blocks[0].address) };
    show("100 bytes", allocator.allocate(100), base);

    println!("Best fit");
    let mut memory = buffer();
    let mut allocator = BestFitAllocator::new(&mut memory.0);
    let base = allocator.region();

    let blocks: Vec<_> = [1024, 32, 128, 32, 512]
        .map(|size| allocator.allocate(size))
        .into();
    unsafe {
        allocator.free(blocks[0].address);
        allocator.free(blocks[2].address);
    }
    show("100 bytes", allocator.allocate(100), base);
    print!("{}", allocator.dump_tree());
}

fn lock_free() {
    println!("Lock-free bump");
    let mut memory = buffer();
    let allocator = LockFreeBumpAllocator::new(&mut memory.0);
    let base = allocator.region();

    let mut granted: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| allocator.allocate(256)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    granted.sort();
    for region in granted {
        show("thread", region, base);
    }
}

fn synchronized() {
    println!("Synchronized");
    let mut memory = vec![0u8; kib(16)];
    let allocator = Synchronized::new(BestFitAllocator::new(&mut memory[..]));

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| unsafe {
                let layout = Layout::array::<u64>(64).unwrap();
                let address = allocator.alloc(layout);
                address.write_bytes(1, layout.size());
                allocator.dealloc(address, layout);
            });
        }
    });

    println!("{:>12}: {} bytes", "used", allocator.lock().used());
}

fn main() {
    env_logger::init();

    bump();
    stack();
    pool();
    buddy();
    free_lists();
    lock_free();
    synchronized();
}
