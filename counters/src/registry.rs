//! Named counter registry.
//!
//! Maps `(name, size)` to a stable counter id. `size` is the number of
//! 64-bit slots the counter occupies, one of {1, 2, 4, 8, 16}; it selects
//! the **pool** the counter's storage lives in (pool index = log2(size)).
//! The same name registered with two different sizes yields two distinct
//! counters.
//!
//! Registration is two-phase: `register` only reserves the id, leaving the
//! storage offset at the [`COUNTER_OFFSET_UNLINKED`] sentinel;
//! `link_offsets` assigns pool offsets at publication time. Splitting the
//! phases is what lets counters survive incremental reconfiguration without
//! their storage pages moving.
//!
//! Every entry carries a generation stamp. `register` on an existing entry
//! refreshes the stamp; `expire` retires entries whose stamp has fallen
//! behind, and `link` carries still-current entries from one registry into
//! another, preserving offsets.
//!
//! Mutating operations require the zone's configuration lock (not taken
//! here). The read side is lock-free: an entry becomes visible only after
//! it is fully written (`count` is bumped with release ordering), and a
//! capacity grow retires the old entry array onto a stale chain that is
//! only freed after the next publication's quiescence barrier.

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use flowplane_lib::{Name64, RelPtr};
use flowplane_mem::MemoryContext;
use log::debug;

use crate::error::{CounterError, CounterResult};

pub const COUNTER_PAGE_SIZE: u64 = 4096;
pub const COUNTER_POOL_COUNT: usize = 5;

/// Offset value of a registered counter that has not been linked yet.
pub const COUNTER_OFFSET_UNLINKED: u64 = u64::MAX;

/// Generations a counter may go unrefreshed before the publisher expires
/// it. Owners keep a counter alive by re-registering it (idempotent, and a
/// stamp refresh) when they reconfigure; a counter whose stamp falls this
/// far behind is compacted out of the registry at the next publication.
pub const COUNTER_GC_GENERATIONS: u64 = 64;

/// Pool index for a counter of `size` slots, or `None` for invalid sizes.
pub fn pool_for_size(size: u64) -> Option<u32> {
    match size {
        1 => Some(0),
        2 => Some(1),
        4 => Some(2),
        8 => Some(3),
        16 => Some(4),
        _ => None,
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CounterFlags: u32 {
        const ACTIVE = 1 << 0;
        const LINKED = 1 << 1;
    }
}

#[repr(C)]
pub struct CounterEntry {
    name: Name64,
    size: u16,
    pool: u16,
    flags: u32,
    generation: u64,
    offset: u64,
}

impl CounterEntry {
    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    #[inline]
    pub fn pool(&self) -> u32 {
        self.pool as u32
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        CounterFlags::from_bits_truncate(self.flags).contains(CounterFlags::ACTIVE)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        CounterFlags::from_bits_truncate(self.flags).contains(CounterFlags::LINKED)
    }
}

/// Header written over a retired entry array; the dead array itself
/// provides the storage for the chain node.
#[repr(C)]
struct StaleArray {
    next: RelPtr<StaleArray>,
    bytes: u64,
}

#[repr(C)]
pub struct CounterRegistry {
    entries: RelPtr<CounterEntry>,
    capacity: AtomicU64,
    count: AtomicU64,
    pool_used: [AtomicU64; COUNTER_POOL_COUNT],
    stale: RelPtr<StaleArray>,
}

const POOL_ZERO: AtomicU64 = AtomicU64::new(0);

impl CounterRegistry {
    /// Initialise the registry in place with room for `capacity` entries.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory inside the same segment as the
    /// arena behind `mctx`.
    pub unsafe fn init(this: *mut Self, mctx: &MemoryContext, capacity: u64) -> CounterResult<()> {
        let r = &mut *this;
        r.entries = RelPtr::null();
        r.capacity = AtomicU64::new(0);
        r.count = AtomicU64::new(0);
        r.pool_used = [POOL_ZERO; COUNTER_POOL_COUNT];
        r.stale = RelPtr::null();

        let bytes = capacity * size_of::<CounterEntry>() as u64;
        let arr = mctx.alloc_zeroed(bytes);
        if arr.is_null() {
            return Err(CounterError::OutOfMemory);
        }
        r.entries.store(arr as *mut CounterEntry);
        r.capacity.store(capacity, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn entry_at(&self, idx: u64) -> *mut CounterEntry {
        self.entries.load().add(idx as usize)
    }

    /// Entry for a counter id, or `None` when out of range.
    pub fn entry(&self, id: u64) -> Option<&CounterEntry> {
        if id >= self.count() {
            return None;
        }
        Some(unsafe { &*self.entry_at(id) })
    }

    /// Id of the active counter `(name, size)`, if registered.
    pub fn lookup(&self, name: &str, size: u64) -> Option<u64> {
        let name = Name64::new(name)?;
        let count = self.count();
        for id in 0..count {
            let e = unsafe { &*self.entry_at(id) };
            if e.is_active() && e.size == size as u16 && e.name == name {
                return Some(id);
            }
        }
        None
    }

    /// Register `(name, size)`, refreshing the generation stamp when the
    /// counter already exists. Requires the zone configuration lock.
    pub unsafe fn register(
        &self,
        mctx: &MemoryContext,
        name: &str,
        size: u64,
        generation: u64,
    ) -> CounterResult<u64> {
        let pool = pool_for_size(size).ok_or(CounterError::InvalidSize { size })?;
        let name64 = Name64::new(name).ok_or(CounterError::InvalidName)?;

        let count = self.count();
        for id in 0..count {
            let e = self.entry_at(id);
            if (*e).size == size as u16 && (*e).name == name64 {
                (*e).generation = generation;
                (*e).flags |= CounterFlags::ACTIVE.bits();
                return Ok(id);
            }
        }

        if count == self.capacity() {
            self.grow(mctx)?;
        }

        let e = self.entry_at(count);
        (*e).name = name64;
        (*e).size = size as u16;
        (*e).pool = pool as u16;
        (*e).flags = CounterFlags::ACTIVE.bits();
        (*e).generation = generation;
        (*e).offset = COUNTER_OFFSET_UNLINKED;
        self.count.fetch_add(1, Ordering::Release);
        Ok(count)
    }

    unsafe fn grow(&self, mctx: &MemoryContext) -> CounterResult<()> {
        let old_cap = self.capacity();
        let new_cap = (old_cap * 2).max(8);
        let new_bytes = new_cap * size_of::<CounterEntry>() as u64;
        let new_arr = mctx.alloc_zeroed(new_bytes);
        if new_arr.is_null() {
            return Err(CounterError::OutOfMemory);
        }

        let old_arr = self.entries.load();
        let count = self.count();
        // Entries are plain data (no self-relative fields), safe to copy.
        core::ptr::copy_nonoverlapping(
            old_arr as *const u8,
            new_arr,
            count as usize * size_of::<CounterEntry>(),
        );
        self.entries.store(new_arr as *mut CounterEntry);
        self.capacity.store(new_cap, Ordering::Relaxed);
        self.retire_entries(old_arr, old_cap * size_of::<CounterEntry>() as u64);
        Ok(())
    }

    /// Park a superseded entry array on the stale chain. Readers racing
    /// with the swap may still hold it; it is freed only after the next
    /// quiescence barrier. The dead array provides the chain node storage.
    unsafe fn retire_entries(&self, arr: *mut CounterEntry, bytes: u64) {
        let node = arr as *mut StaleArray;
        core::ptr::addr_of_mut!((*node).next).write(RelPtr::null());
        (*node).bytes = bytes;
        (*node).next.store(self.stale.load());
        self.stale.store(node);
    }

    /// Assign pool offsets to every registered-but-unlinked counter,
    /// stamping them with `gen`. Returns the number of counters linked.
    /// Requires the zone configuration lock.
    pub unsafe fn link_offsets(&self, generation: u64) -> u64 {
        let mut linked = 0u64;
        for id in 0..self.count() {
            let e = self.entry_at(id);
            if !(*e).is_active() || (*e).is_linked() {
                continue;
            }
            let bytes = 8 * (*e).size as u64;
            // Pools hold a single size class, so allocations never straddle
            // a page boundary.
            let off = self.pool_used[(*e).pool as usize].fetch_add(bytes, Ordering::Relaxed);
            (*e).offset = off;
            (*e).flags |= CounterFlags::LINKED.bits();
            (*e).generation = generation;
            linked += 1;
        }
        linked
    }

    /// Bytes of page space assigned within a pool.
    #[inline]
    pub fn pool_used(&self, pool: u32) -> u64 {
        self.pool_used[pool as usize].load(Ordering::Relaxed)
    }

    /// Pages needed to back a pool's assigned space.
    #[inline]
    pub fn pool_pages(&self, pool: u32) -> u64 {
        self.pool_used(pool).div_ceil(COUNTER_PAGE_SIZE)
    }

    /// Deactivate entries whose stamp predates `gen_floor`. A following
    /// [`compact`](Self::compact) reclaims their slots and recomputes pool
    /// usage; holes left inside a pool are not reused, only the tail.
    /// Returns the number retired.
    pub unsafe fn expire(&self, gen_floor: u64) -> u64 {
        let mut expired = 0u64;
        for id in 0..self.count() {
            let e = self.entry_at(id);
            if (*e).is_active() && (*e).generation < gen_floor {
                (*e).flags &= !CounterFlags::ACTIVE.bits();
                expired += 1;
            }
        }
        expired
    }

    /// Carry forward still-current entries (`gen >= gen_floor`) from `src`,
    /// preserving their offsets so existing storage pages remain valid.
    /// Returns the number of entries carried.
    pub unsafe fn link(
        &self,
        mctx: &MemoryContext,
        src: &CounterRegistry,
        gen_floor: u64,
    ) -> CounterResult<u64> {
        let mut carried = 0u64;
        for id in 0..src.count() {
            let e = &*src.entry_at(id);
            if !e.is_active() || e.generation < gen_floor {
                continue;
            }
            let count = self.count();
            if count == self.capacity() {
                self.grow(mctx)?;
            }
            let dst = self.entry_at(count);
            core::ptr::copy_nonoverlapping(e as *const CounterEntry, dst, 1);
            if e.is_linked() {
                let end = e.offset + 8 * e.size as u64;
                self.pool_used[e.pool as usize].fetch_max(end, Ordering::Relaxed);
            }
            self.count.fetch_add(1, Ordering::Release);
            carried += 1;
        }
        Ok(carried)
    }

    /// Rebuild the entry array with only the active entries, carried over
    /// with [`link`](Self::link) so their offsets (and therefore their
    /// storage pages) are preserved. The old array is retired onto the
    /// stale chain and ids are reassigned — callers resolve by name, no id
    /// survives a publication. Pool usage is recomputed from the
    /// survivors, so storage spawned afterwards sheds unused tail blocks.
    /// The replacement keeps the same capacity: a reader racing on the old
    /// count never indexes past the allocation, and the zeroed tail reads
    /// as inactive. Requires the zone configuration lock. Returns the
    /// surviving count.
    pub unsafe fn compact(&self, mctx: &MemoryContext) -> CounterResult<u64> {
        let capacity = self.capacity();
        let mut scratch = core::mem::zeroed::<CounterRegistry>();
        Self::init(&mut scratch as *mut _, mctx, capacity)?;
        // Floor 0: expire() has already dropped everything stale.
        let carried = scratch.link(mctx, self, 0)?;

        let old_arr = self.entries.load();
        for pool in 0..COUNTER_POOL_COUNT {
            self.pool_used[pool].store(
                scratch.pool_used[pool].load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
        self.count.store(scratch.count(), Ordering::Release);
        self.entries.store(scratch.entries.load());
        self.retire_entries(old_arr, capacity * size_of::<CounterEntry>() as u64);
        Ok(carried)
    }

    /// Free retired entry arrays. Only safe after a quiescence barrier has
    /// passed since the last grow.
    pub unsafe fn drain_stale(&self, mctx: &MemoryContext) -> u64 {
        let mut freed = 0u64;
        let mut node = self.stale.load();
        self.stale.store(core::ptr::null_mut());
        while !node.is_null() {
            let next = (*node).next.load();
            let bytes = (*node).bytes;
            mctx.free(node as *mut u8, bytes);
            node = next;
            freed += 1;
        }
        if freed > 0 {
            debug!("freed {freed} stale counter entry arrays");
        }
        freed
    }
}
