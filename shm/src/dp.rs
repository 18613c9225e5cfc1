//! Dataplane zone: worker slots and the immutable module table.
//!
//! The dataplane owns the front of each zone. It is initialised once at
//! dataplane startup and immutable afterwards: a table of module kind
//! names (handler function pointers stay process-local in the dataplane,
//! parallel to this table) and one cache-line-aligned slot per worker.
//!
//! A worker's `gen` counter is its quiescence signal: it stores the
//! generation number it observed at the end of every iteration, and the
//! publisher waits for all workers to reach the freshly published number
//! before reclaiming the superseded one.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use flowplane_lib::align::align_up_u64;
use flowplane_lib::{Name80, PidLock, RelPtr};
use flowplane_mem::{BlockAllocator, MemoryContext};

use crate::cp::CpConfig;
use crate::error::{ShmError, ShmResult};

#[repr(C)]
pub struct DpModuleEntry {
    name: Name80,
}

impl DpModuleEntry {
    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

#[repr(C, align(64))]
pub struct DpWorker {
    idx: u64,
    generation: AtomicU64,
    iterations: AtomicU64,
    owner_pid: AtomicU32,
}

impl DpWorker {
    #[inline]
    pub fn idx(&self) -> u64 {
        self.idx
    }

    /// Latest generation this worker has fully observed.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Publish quiescence: a single relaxed-path store at the end of an
    /// iteration, release so the publisher sees the iteration's reads as
    /// complete.
    #[inline]
    pub fn store_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    #[inline]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bump_iterations(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the slot for a worker thread of `pid`. Fails when the slot is
    /// already owned.
    pub fn claim(&self, pid: u32) -> bool {
        self.owner_pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_claim(&self) {
        self.owner_pid.store(0, Ordering::Release);
    }

    #[inline]
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid.load(Ordering::Relaxed)
    }
}

#[repr(C)]
pub struct DpConfig {
    lock: PidLock,
    _pad0: u32,
    worker_count: u64,
    workers: RelPtr<DpWorker>,
    module_count: u64,
    modules: RelPtr<DpModuleEntry>,
    cp: RelPtr<CpConfig>,
    balloc: BlockAllocator,
    mctx: MemoryContext,
}

impl DpConfig {
    /// Initialise a zone: dataplane struct and arena at the front,
    /// controlplane sub-zone at `dp_arena_size`.
    ///
    /// # Safety
    ///
    /// `zone` must point to `zone_size` writable bytes, page-aligned, not
    /// yet visible to other processes.
    pub unsafe fn init(
        zone: *mut u8,
        zone_size: u64,
        dp_arena_size: u64,
        worker_count: u32,
        module_names: &[&str],
    ) -> ShmResult<*mut DpConfig> {
        let hdr = align_up_u64(size_of::<Self>() as u64, 64);
        if dp_arena_size % 4096 != 0
            || dp_arena_size <= hdr + 4096
            || zone_size <= dp_arena_size
        {
            return Err(ShmError::InvalidArgument);
        }

        let this = zone as *mut DpConfig;
        let d = &mut *this;
        d.lock = PidLock::new();
        d._pad0 = 0;
        d.worker_count = 0;
        d.workers = RelPtr::null();
        d.module_count = 0;
        d.modules = RelPtr::null();
        d.cp = RelPtr::null();

        let arena = zone.add(hdr as usize);
        BlockAllocator::init(&mut d.balloc as *mut _, arena, dp_arena_size - hdr);
        MemoryContext::init(&mut d.mctx as *mut _, "dataplane", &mut d.balloc as *mut _);

        let me = &*this;
        if worker_count > 0 {
            let bytes = worker_count as u64 * size_of::<DpWorker>() as u64;
            let workers = me.mctx.alloc_zeroed(bytes) as *mut DpWorker;
            if workers.is_null() {
                return Err(ShmError::OutOfMemory);
            }
            for i in 0..worker_count as u64 {
                (*workers.add(i as usize)).idx = i;
            }
            me.workers.store(workers);
            (*this).worker_count = worker_count as u64;
        }

        if !module_names.is_empty() {
            let bytes = module_names.len() as u64 * size_of::<DpModuleEntry>() as u64;
            let table = me.mctx.alloc_zeroed(bytes) as *mut DpModuleEntry;
            if table.is_null() {
                return Err(ShmError::OutOfMemory);
            }
            for (i, name) in module_names.iter().enumerate() {
                let name = Name80::new(name).ok_or(ShmError::InvalidArgument)?;
                (*table.add(i)).name = name;
            }
            me.modules.store(table);
            (*this).module_count = module_names.len() as u64;
        }

        let cp = zone.add(dp_arena_size as usize) as *mut CpConfig;
        CpConfig::init(cp, zone_size - dp_arena_size, worker_count as u64)?;
        me.cp.store(cp);
        Ok(this)
    }

    #[inline]
    pub fn lock(&self) -> &PidLock {
        &self.lock
    }

    #[inline]
    pub fn mctx(&self) -> &MemoryContext {
        &self.mctx
    }

    #[inline]
    pub fn worker_count(&self) -> u64 {
        self.worker_count
    }

    /// Worker slot `idx`, or `None` when out of range.
    pub fn worker(&self, idx: u64) -> Option<&DpWorker> {
        if idx >= self.worker_count {
            return None;
        }
        Some(unsafe { &*self.workers.load().add(idx as usize) })
    }

    /// Minimum observed generation across all workers; `u64::MAX` when the
    /// zone has no workers.
    pub fn min_worker_gen(&self) -> u64 {
        let mut min = u64::MAX;
        for idx in 0..self.worker_count {
            if let Some(w) = self.worker(idx) {
                min = min.min(w.generation());
            }
        }
        min
    }

    #[inline]
    pub fn module_count(&self) -> u64 {
        self.module_count
    }

    /// Name of module kind `idx`.
    pub fn module_name(&self, idx: u32) -> Option<&str> {
        if (idx as u64) >= self.module_count {
            return None;
        }
        Some(unsafe { (*self.modules.load().add(idx as usize)).name() })
    }

    /// Look up a module kind by name in the immutable table.
    pub fn lookup_module(&self, name: &str) -> Option<u32> {
        for idx in 0..self.module_count {
            let entry = unsafe { &*self.modules.load().add(idx as usize) };
            if entry.name() == name {
                return Some(idx as u32);
            }
        }
        None
    }

    /// The zone's controlplane sub-zone.
    #[inline]
    pub fn cp_config(&self) -> *mut CpConfig {
        self.cp.load()
    }
}
