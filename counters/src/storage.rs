//! Multi-instance counter storage snapshots.
//!
//! Storage is organised per pool as an array of refcounted **blocks**; a
//! block is a 64-byte header followed by `instance_count` pages of 4096
//! bytes, one page per instance. A counter at pool offset `o` lives in
//! block `o / 4096`, at line `o % 4096` within each instance's page — so
//! the increment path is one offset dereference plus arithmetic, and every
//! instance (DP worker) writes only its own page.
//!
//! Snapshots are immutable once spawned. A new snapshot reuses the previous
//! snapshot's blocks (refcount++) wherever the pool did not grow and
//! allocates zeroed blocks only for the growth, so counter values survive
//! reconfiguration without page churn. Blocks are freed when their
//! refcount drops to zero; the snapshot node itself is refcounted the same
//! way so a publication that links no new counters can share the whole
//! snapshot.

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use flowplane_lib::RelPtr;
use flowplane_mem::MemoryContext;

use crate::error::{CounterError, CounterResult};
use crate::registry::{COUNTER_PAGE_SIZE, COUNTER_POOL_COUNT, CounterRegistry};

/// Bytes reserved for the block header; keeps page data cache-line aligned.
pub const COUNTER_BLOCK_HEADER: u64 = 64;

#[repr(C)]
pub struct CounterBlock {
    refcnt: AtomicU64,
    _pad: [u64; 7],
}

impl CounterBlock {
    #[inline]
    pub fn refcnt(&self) -> u64 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Base of the per-instance page array.
    ///
    /// # Safety
    ///
    /// `block` must be a live block allocated by [`CounterStorage::spawn`].
    #[inline]
    pub unsafe fn pages(block: *mut CounterBlock) -> *mut u8 {
        (block as *mut u8).add(COUNTER_BLOCK_HEADER as usize)
    }
}

#[repr(C)]
struct StoragePool {
    blocks: RelPtr<RelPtr<CounterBlock>>,
    block_count: u64,
    block_cap: u64,
}

#[repr(C)]
pub struct CounterStorage {
    refcnt: AtomicU64,
    instance_count: u64,
    pools: [StoragePool; COUNTER_POOL_COUNT],
}

/// Allocation size of one block for the given instance count.
#[inline]
fn block_bytes(instance_count: u64) -> u64 {
    COUNTER_BLOCK_HEADER + instance_count * COUNTER_PAGE_SIZE
}

impl CounterStorage {
    #[inline]
    pub fn instance_count(&self) -> u64 {
        self.instance_count
    }

    #[inline]
    pub fn refcnt(&self) -> u64 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Number of live blocks in a pool.
    #[inline]
    pub fn pool_blocks(&self, pool: u32) -> u64 {
        self.pools[pool as usize].block_count
    }

    /// Block `idx` of `pool`, or `None` when out of range.
    pub fn block(&self, pool: u32, idx: u64) -> Option<*mut CounterBlock> {
        let p = &self.pools[pool as usize];
        if idx >= p.block_count {
            return None;
        }
        let arr = p.blocks.load();
        Some(unsafe { (*arr.add(idx as usize)).load() })
    }

    /// Spawn a storage snapshot sized to `registry`'s linked pools, sharing
    /// blocks with `old` (which may be null) wherever a pool did not grow.
    /// Requires the zone configuration lock.
    ///
    /// # Safety
    ///
    /// `old` must be null or a live snapshot allocated from the same
    /// `mctx`. A pool may have shrunk since `old` was spawned (registry
    /// compaction); blocks beyond the new page count stay owned by `old`
    /// alone and are freed with it.
    pub unsafe fn spawn(
        mctx: &MemoryContext,
        old: *const CounterStorage,
        registry: &CounterRegistry,
        instance_count: u64,
    ) -> CounterResult<*mut CounterStorage> {
        let node = mctx.alloc_zeroed(size_of::<CounterStorage>() as u64) as *mut CounterStorage;
        if node.is_null() {
            return Err(CounterError::OutOfMemory);
        }
        (*node).refcnt.store(1, Ordering::Relaxed);
        (*node).instance_count = instance_count;

        for pool in 0..COUNTER_POOL_COUNT as u32 {
            let needed = registry.pool_pages(pool);
            if needed == 0 {
                continue;
            }
            let arr = mctx.alloc_zeroed(needed * size_of::<RelPtr<CounterBlock>>() as u64)
                as *mut RelPtr<CounterBlock>;
            if arr.is_null() {
                Self::release(mctx, node);
                return Err(CounterError::OutOfMemory);
            }
            let p = &mut (*node).pools[pool as usize];
            p.blocks.store(arr);
            p.block_cap = needed;

            let old_count = if old.is_null() {
                0
            } else {
                (*old).pools[pool as usize].block_count
            };

            for idx in 0..needed {
                let block = if idx < old_count {
                    let shared = (*old).block(pool, idx).unwrap_or(core::ptr::null_mut());
                    (*shared).refcnt.fetch_add(1, Ordering::Relaxed);
                    shared
                } else {
                    let fresh = mctx.alloc_zeroed(block_bytes(instance_count)) as *mut CounterBlock;
                    if fresh.is_null() {
                        Self::release(mctx, node);
                        return Err(CounterError::OutOfMemory);
                    }
                    (*fresh).refcnt.store(1, Ordering::Relaxed);
                    fresh
                };
                (*arr.add(idx as usize)).store(block);
                (*node).pools[pool as usize].block_count = idx + 1;
            }
        }
        Ok(node)
    }

    /// Take an extra reference on a snapshot shared with a new generation.
    ///
    /// # Safety
    ///
    /// `storage` must be a live snapshot.
    pub unsafe fn acquire(storage: *mut CounterStorage) {
        (*storage).refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; at zero, releases every block (freeing those
    /// whose own refcount reaches zero), the block arrays and the node.
    ///
    /// # Safety
    ///
    /// `storage` must be a live snapshot allocated from `mctx`, unreachable
    /// by readers (post quiescence).
    pub unsafe fn release(mctx: &MemoryContext, storage: *mut CounterStorage) {
        if (*storage).refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let instances = (*storage).instance_count;
        for pool in 0..COUNTER_POOL_COUNT {
            let p = &(*storage).pools[pool];
            let arr = p.blocks.load();
            if arr.is_null() {
                continue;
            }
            for idx in 0..p.block_count {
                let block = (*arr.add(idx as usize)).load();
                if (*block).refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                    mctx.free(block as *mut u8, block_bytes(instances));
                }
            }
            mctx.free(
                arr as *mut u8,
                p.block_cap * size_of::<RelPtr<CounterBlock>>() as u64,
            );
        }
        mctx.free(storage as *mut u8, size_of::<CounterStorage>() as u64);
    }
}
