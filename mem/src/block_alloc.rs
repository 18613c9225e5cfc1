//! Buddy block allocator over a fixed shared-memory arena.
//!
//! The allocator carves one contiguous arena into power-of-two blocks,
//! minimum 64 bytes. Free blocks are kept on order-indexed free lists; the
//! list links are self-relative pointers written into the free memory
//! itself, so the allocator state is fully position-independent and carries
//! no per-block metadata. Every outstanding allocation is a single
//! power-of-two block aligned to its own size (relative to the arena base).
//!
//! Allocation splits a larger block downward when the requested order is
//! empty; freeing merges a block with its XOR-buddy while the buddy is also
//! free. Callers always know the size they allocated (every allocation
//! backs a fully typed object), so `free` takes the original size instead
//! of reading a header.
//!
//! All operations serialise on an internal [`PidLock`]; the allocator is
//! only exercised on the configuration plane, never per packet.

use core::sync::atomic::{AtomicU64, Ordering};

use flowplane_lib::align::align_down_u64;
use flowplane_lib::{PidLock, RelPtr};
use log::error;

use crate::error::{MemError, set_last_error};

pub const BLOCK_MIN_SHIFT: u32 = 6;
pub const BLOCK_MIN_SIZE: u64 = 1 << BLOCK_MIN_SHIFT;

/// Orders 0..28 cover blocks of 64 bytes up to 8 GiB.
pub const BLOCK_NUM_ORDERS: usize = 28;

/// Size in bytes of a block of the given order.
#[inline(always)]
pub const fn order_size(order: u32) -> u64 {
    BLOCK_MIN_SIZE << order
}

/// Order of the smallest block that can hold `size` bytes, or `None` when
/// the size is zero or beyond the largest supported order.
pub fn order_for_size(size: u64) -> Option<u32> {
    if size == 0 {
        return None;
    }
    let rounded = flowplane_lib::align::round_up_pow2_u64(size.max(BLOCK_MIN_SIZE));
    let order = rounded.trailing_zeros() - BLOCK_MIN_SHIFT;
    if (order as usize) < BLOCK_NUM_ORDERS {
        Some(order)
    } else {
        None
    }
}

/// Rounded block size actually consumed by an allocation of `size` bytes.
pub fn block_size_for(size: u64) -> Option<u64> {
    order_for_size(size).map(order_size)
}

/// Link node written into the first bytes of every free block.
#[repr(C)]
struct FreeBlock {
    next: RelPtr<FreeBlock>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockAllocStats {
    pub arena_size: u64,
    pub free_bytes: u64,
    pub allocated_bytes: u64,
    pub max_order: u32,
}

#[repr(C)]
pub struct BlockAllocator {
    lock: PidLock,
    arena: RelPtr<u8>,
    arena_size: u64,
    max_order: u32,
    _reserved: u32,
    free_bytes: AtomicU64,
    allocated_bytes: AtomicU64,
    free_lists: [RelPtr<FreeBlock>; BLOCK_NUM_ORDERS],
}

const NULL_LIST: RelPtr<FreeBlock> = RelPtr::null();

impl BlockAllocator {
    /// Initialise the allocator in place over `arena`.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory large enough for the struct and
    /// `arena..arena+arena_size` must be a valid, exclusively owned region.
    /// Both must live inside the same mapped segment. No other process may
    /// observe the allocator until this returns.
    pub unsafe fn init(this: *mut Self, arena: *mut u8, arena_size: u64) {
        let a = &mut *this;
        a.lock = PidLock::new();
        a.arena = RelPtr::null();
        a.arena_size = align_down_u64(arena_size, BLOCK_MIN_SIZE);
        a.max_order = derive_max_order(a.arena_size);
        a._reserved = 0;
        a.free_bytes = AtomicU64::new(0);
        a.allocated_bytes = AtomicU64::new(0);
        a.free_lists = [NULL_LIST; BLOCK_NUM_ORDERS];
        a.arena.store(arena);

        // Seed the free lists greedily: the largest block that both fits the
        // remaining span and is aligned to its own size relative to the
        // arena base. This keeps the buddy invariant for arenas that are not
        // a power of two.
        let me = &*this;
        let mut cursor = 0u64;
        while me.arena_size - cursor >= BLOCK_MIN_SIZE {
            let remaining = me.arena_size - cursor;
            let mut order = me.max_order;
            while order_size(order) > remaining || cursor % order_size(order) != 0 {
                order -= 1;
            }
            me.push_free(cursor, order);
            me.free_bytes.fetch_add(order_size(order), Ordering::Relaxed);
            cursor += order_size(order);
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.arena.load()
    }

    #[inline]
    fn block_at(&self, offset: u64) -> *mut FreeBlock {
        unsafe { self.base().add(offset as usize) as *mut FreeBlock }
    }

    /// Allocate a block large enough for `size` bytes. Returns NULL on
    /// failure and records the reason in the per-thread error indicator.
    pub fn alloc(&self, size: u64) -> *mut u8 {
        let Some(order) = order_for_size(size) else {
            set_last_error(MemError::InvalidSize { size });
            return core::ptr::null_mut();
        };
        if order > self.max_order {
            set_last_error(MemError::OutOfMemory);
            return core::ptr::null_mut();
        }

        let _guard = self.lock.lock();
        let mut current = order;
        let block = loop {
            if current > self.max_order {
                set_last_error(MemError::OutOfMemory);
                return core::ptr::null_mut();
            }
            let b = self.pop_free(current);
            if !b.is_null() {
                break b;
            }
            current += 1;
        };

        // Split back down to the requested order, returning the upper half
        // at each step.
        while current > order {
            current -= 1;
            let buddy_off = self.offset_of(block as *mut u8) + order_size(current);
            self.push_free(buddy_off, current);
        }

        self.free_bytes.fetch_sub(order_size(order), Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(order_size(order), Ordering::Relaxed);
        block as *mut u8
    }

    /// Return a block to the arena, merging with its buddy where possible.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior [`alloc`](Self::alloc) on this allocator
    /// and `size` must be the size passed to that call. The block must not
    /// be referenced after this returns.
    pub unsafe fn free(&self, ptr: *mut u8, size: u64) {
        let Some(mut order) = order_for_size(size) else {
            error!("free of unallocatable size {size}");
            return;
        };
        let charged = order_size(order);
        let mut offset = self.offset_of(ptr);

        let _guard = self.lock.lock();
        while order < self.max_order {
            let buddy_off = offset ^ order_size(order);
            if buddy_off + order_size(order) > self.arena_size {
                break;
            }
            if !self.detach_free(buddy_off, order) {
                break;
            }
            offset = offset.min(buddy_off);
            order += 1;
        }
        self.push_free(offset, order);

        self.free_bytes.fetch_add(charged, Ordering::Relaxed);
        self.allocated_bytes.fetch_sub(charged, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BlockAllocStats {
        BlockAllocStats {
            arena_size: self.arena_size,
            free_bytes: self.free_bytes.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            max_order: self.max_order,
        }
    }

    #[inline]
    fn offset_of(&self, ptr: *mut u8) -> u64 {
        (ptr as usize - self.base() as usize) as u64
    }

    fn push_free(&self, offset: u64, order: u32) {
        let block = self.block_at(offset);
        unsafe {
            // The block body is arbitrary recycled bytes; initialise the
            // link in place before touching it through a reference.
            core::ptr::addr_of_mut!((*block).next).write(RelPtr::null());
            (*block).next.store(self.free_lists[order as usize].load());
        }
        self.free_lists[order as usize].store(block);
    }

    fn pop_free(&self, order: u32) -> *mut FreeBlock {
        let head = self.free_lists[order as usize].load();
        if head.is_null() {
            return core::ptr::null_mut();
        }
        let next = unsafe { (*head).next.load() };
        self.free_lists[order as usize].store(next);
        head
    }

    /// Unlink the block at `offset` from the free list of `order`.
    /// Returns false when the block is not on that list (the buddy is in
    /// use, or split to a smaller order).
    fn detach_free(&self, offset: u64, order: u32) -> bool {
        let target = self.block_at(offset);
        let mut slot: *const RelPtr<FreeBlock> = &self.free_lists[order as usize];
        loop {
            let current = unsafe { (*slot).load() };
            if current.is_null() {
                return false;
            }
            if current == target {
                let next = unsafe { (*current).next.load() };
                unsafe { (*slot).store(next) };
                return true;
            }
            slot = unsafe { core::ptr::addr_of!((*current).next) };
        }
    }
}

fn derive_max_order(arena_size: u64) -> u32 {
    let mut order = 0u32;
    while ((order + 1) as usize) < BLOCK_NUM_ORDERS && order_size(order + 1) <= arena_size {
        order += 1;
    }
    order
}
