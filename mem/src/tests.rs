use core::alloc::Layout;
use core::mem::size_of;

use crate::block_alloc::{BLOCK_MIN_SIZE, BlockAllocator, block_size_for, order_for_size};
use crate::context::MemoryContext;
use crate::error::{MemError, take_last_error};

/// Page-aligned scratch arena standing in for a zone of the shared segment.
struct TestArena {
    ptr: *mut u8,
    layout: Layout,
}

impl TestArena {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

fn make_allocator(arena: &TestArena, arena_size: u64) -> Box<BlockAllocator> {
    let mut alloc: Box<BlockAllocator> =
        unsafe { Box::new(core::mem::zeroed::<BlockAllocator>()) };
    unsafe { BlockAllocator::init(alloc.as_mut() as *mut _, arena.ptr(), arena_size) };
    alloc
}

#[test]
fn order_math() {
    assert_eq!(order_for_size(0), None);
    assert_eq!(order_for_size(1), Some(0));
    assert_eq!(order_for_size(64), Some(0));
    assert_eq!(order_for_size(65), Some(1));
    assert_eq!(order_for_size(4096), Some(6));
    assert_eq!(block_size_for(100), Some(128));
    assert_eq!(block_size_for(BLOCK_MIN_SIZE), Some(BLOCK_MIN_SIZE));
}

#[test]
fn alloc_free_single_block() {
    let arena = TestArena::new(1 << 20);
    let alloc = make_allocator(&arena, 1 << 20);

    let p = alloc.alloc(100);
    assert!(!p.is_null());
    // Inside the arena, and aligned to the rounded block size relative to
    // the arena base.
    let off = p as usize - arena.ptr() as usize;
    assert!(off + 128 <= 1 << 20);
    assert_eq!(off % 128, 0);

    let stats = alloc.stats();
    assert_eq!(stats.allocated_bytes, 128);

    unsafe { alloc.free(p, 100) };
    let stats = alloc.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_bytes, stats.arena_size);
}

#[test]
fn distinct_blocks_do_not_overlap() {
    let arena = TestArena::new(1 << 16);
    let alloc = make_allocator(&arena, 1 << 16);

    let a = alloc.alloc(1000);
    let b = alloc.alloc(1000);
    assert!(!a.is_null() && !b.is_null());
    let (a, b) = (a as usize, b as usize);
    assert!(a + 1024 <= b || b + 1024 <= a);
    unsafe {
        alloc.free(a as *mut u8, 1000);
        alloc.free(b as *mut u8, 1000);
    }
}

#[test]
fn split_then_merge_restores_whole_arena() {
    // A power-of-two arena seeds as a single top-order block; after
    // splitting it in two and freeing both halves, the whole arena must be
    // allocatable again.
    let arena = TestArena::new(1 << 16);
    let alloc = make_allocator(&arena, 1 << 16);

    let whole = alloc.alloc(1 << 16);
    assert!(!whole.is_null());
    unsafe { alloc.free(whole, 1 << 16) };

    let a = alloc.alloc(1 << 15);
    let b = alloc.alloc(1 << 15);
    assert!(!a.is_null() && !b.is_null());
    unsafe {
        alloc.free(a, 1 << 15);
        alloc.free(b, 1 << 15);
    }

    let whole = alloc.alloc(1 << 16);
    assert!(!whole.is_null(), "buddies did not coalesce");
    unsafe { alloc.free(whole, 1 << 16) };
}

#[test]
fn oversized_request_reports_oom() {
    let arena = TestArena::new(1 << 16);
    let alloc = make_allocator(&arena, 1 << 16);

    take_last_error();
    let p = alloc.alloc(1 << 17);
    assert!(p.is_null());
    assert_eq!(take_last_error(), Some(MemError::OutOfMemory));
}

#[test]
fn zero_size_is_invalid() {
    let arena = TestArena::new(1 << 16);
    let alloc = make_allocator(&arena, 1 << 16);

    take_last_error();
    let p = alloc.alloc(0);
    assert!(p.is_null());
    assert_eq!(take_last_error(), Some(MemError::InvalidSize { size: 0 }));
}

#[test]
fn exhaustion_then_release() {
    let arena = TestArena::new(1 << 16);
    let alloc = make_allocator(&arena, 1 << 16);

    let mut blocks = Vec::new();
    loop {
        let p = alloc.alloc(4096);
        if p.is_null() {
            break;
        }
        blocks.push(p);
    }
    assert_eq!(blocks.len(), (1 << 16) / 4096);
    assert_eq!(take_last_error(), Some(MemError::OutOfMemory));

    for p in &blocks {
        unsafe { alloc.free(*p, 4096) };
    }
    let whole = alloc.alloc(1 << 16);
    assert!(!whole.is_null());
}

#[test]
fn context_charges_rounded_sizes_and_balances() {
    let arena = TestArena::new(1 << 18);
    let alloc = make_allocator(&arena, 1 << 18);
    let mut ctx: MemoryContext = unsafe { core::mem::zeroed() };
    unsafe { MemoryContext::init(&mut ctx as *mut _, "test", alloc.as_ref() as *const _ as *mut _) };
    assert_eq!(ctx.name(), "test");

    let p = ctx.alloc(100);
    assert!(!p.is_null());
    assert_eq!(ctx.balloc_size(), 128);
    assert!(!ctx.is_balanced());

    let q = ctx.alloc_zeroed(4096);
    assert!(!q.is_null());
    for i in 0..4096 {
        assert_eq!(unsafe { *q.add(i) }, 0);
    }

    unsafe {
        ctx.free(p, 100);
        ctx.free(q, 4096);
    }
    assert_eq!(ctx.balloc_size(), ctx.bfree_size());
    assert!(ctx.is_balanced());
}

#[test]
fn allocator_struct_is_position_independent() {
    // The allocator must not embed absolute pointers: its struct contains
    // only relative references, so its size is independent of where it is
    // placed. Spot-check the free-list area is offsets, not addresses, by
    // allocating from a struct placed inside the arena itself.
    let arena = TestArena::new(1 << 16);
    let alloc_ptr = arena.ptr() as *mut BlockAllocator;
    let hdr = flowplane_lib::align::align_up_usize(size_of::<BlockAllocator>(), 64);
    unsafe {
        BlockAllocator::init(
            alloc_ptr,
            arena.ptr().add(hdr),
            (1 << 16) - hdr as u64,
        );
        let p = (*alloc_ptr).alloc(256);
        assert!(!p.is_null());
        (*alloc_ptr).free(p, 256);
        assert!((*alloc_ptr).stats().allocated_bytes == 0);
    }
}
