//! Controlplane zone: registries, configuration generations, agents.
//!
//! A **configuration generation** is an immutable snapshot of the module,
//! pipeline and device registries plus the counter storage snapshot,
//! identified by a strictly increasing number. The zone holds a single
//! current-generation pointer that writers swap atomically under the zone
//! lock; dataplane workers only ever read through it.
//!
//! Registries are never mutated in place. A publication rebuilds the one
//! registry it changes and shares the others by offset; each registry
//! carries a refcount so generations sharing it can be reclaimed in any
//! order. Module data records are owned by their agents and are *not*
//! freed with the registry that references them.

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use flowplane_counters::{CounterRegistry, CounterStorage};
use flowplane_lib::align::align_up_u64;
use flowplane_lib::{Name80, PidLock, RelPtr};
use flowplane_mem::{BlockAllocator, MemoryContext};

use crate::error::{ShmError, ShmResult};
use crate::module::{AgentRecord, ModuleData};

// =============================================================================
// Module registry
// =============================================================================

/// Immutable array of offsets to the currently active module data records.
/// The slot array follows the header inline.
#[repr(C)]
pub struct ModuleRegistry {
    refcnt: AtomicU64,
    count: u64,
}

impl ModuleRegistry {
    pub const fn alloc_size(count: u64) -> u64 {
        size_of::<Self>() as u64 + count * size_of::<RelPtr<ModuleData>>() as u64
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size(count)` zeroed bytes.
    pub unsafe fn init(this: *mut Self, count: u64) {
        (*this).refcnt = AtomicU64::new(1);
        (*this).count = count;
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// # Safety
    ///
    /// `idx` must be below [`count`](Self::count).
    #[inline]
    pub unsafe fn slot(&self, idx: u64) -> &RelPtr<ModuleData> {
        let base =
            (self as *const Self as *const u8).add(size_of::<Self>()) as *const RelPtr<ModuleData>;
        &*base.add(idx as usize)
    }

    /// # Safety
    ///
    /// `idx` must be below [`count`](Self::count).
    #[inline]
    pub unsafe fn module(&self, idx: u64) -> *mut ModuleData {
        self.slot(idx).load()
    }

    /// Position of the module data matching `(index, name)`.
    ///
    /// # Safety
    ///
    /// All slots must reference live module data.
    pub unsafe fn lookup(&self, index: u32, name: &Name80) -> Option<u64> {
        for idx in 0..self.count {
            let m = self.module(idx);
            if !m.is_null() && (*m).matches(index, name) {
                return Some(idx);
            }
        }
        None
    }

    pub fn acquire(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; frees the registry node (not the module data it
    /// references) at zero. Returns true when freed.
    ///
    /// # Safety
    ///
    /// `this` must have been allocated from `mctx` with `alloc_size(count)`.
    pub unsafe fn release(this: *mut Self, mctx: &MemoryContext) -> bool {
        if (*this).refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        let bytes = Self::alloc_size((*this).count);
        mctx.free(this as *mut u8, bytes);
        true
    }
}

// =============================================================================
// Pipelines
// =============================================================================

/// Fixed sequence of module registry positions. Inline u64 array follows.
#[repr(C)]
pub struct Pipeline {
    module_count: u64,
}

impl Pipeline {
    pub const fn alloc_size(module_count: u64) -> u64 {
        size_of::<Self>() as u64 + module_count * 8
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size(modules.len())` writable bytes.
    pub unsafe fn init(this: *mut Self, modules: &[u64]) {
        (*this).module_count = modules.len() as u64;
        let arr = (this as *mut u8).add(size_of::<Self>()) as *mut u64;
        for (i, &m) in modules.iter().enumerate() {
            arr.add(i).write(m);
        }
    }

    #[inline]
    pub fn module_count(&self) -> u64 {
        self.module_count
    }

    /// # Safety
    ///
    /// The pipeline must have been initialised.
    #[inline]
    pub unsafe fn modules(&self) -> &[u64] {
        let arr = (self as *const Self as *const u8).add(size_of::<Self>()) as *const u64;
        core::slice::from_raw_parts(arr, self.module_count as usize)
    }
}

/// Immutable array of offsets to pipelines; owns the pipelines it holds.
#[repr(C)]
pub struct PipelineRegistry {
    refcnt: AtomicU64,
    count: u64,
}

impl PipelineRegistry {
    pub const fn alloc_size(count: u64) -> u64 {
        size_of::<Self>() as u64 + count * size_of::<RelPtr<Pipeline>>() as u64
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size(count)` zeroed bytes.
    pub unsafe fn init(this: *mut Self, count: u64) {
        (*this).refcnt = AtomicU64::new(1);
        (*this).count = count;
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// # Safety
    ///
    /// `idx` must be below [`count`](Self::count).
    #[inline]
    pub unsafe fn slot(&self, idx: u64) -> &RelPtr<Pipeline> {
        let base =
            (self as *const Self as *const u8).add(size_of::<Self>()) as *const RelPtr<Pipeline>;
        &*base.add(idx as usize)
    }

    /// # Safety
    ///
    /// `idx` must be below [`count`](Self::count).
    #[inline]
    pub unsafe fn pipeline(&self, idx: u64) -> *mut Pipeline {
        self.slot(idx).load()
    }

    pub fn acquire(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `this` and its pipelines must have been allocated from `mctx`.
    pub unsafe fn release(this: *mut Self, mctx: &MemoryContext) -> bool {
        if (*this).refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        for idx in 0..(*this).count {
            let p = (*this).pipeline(idx);
            if !p.is_null() {
                mctx.free(p as *mut u8, Pipeline::alloc_size((*p).module_count));
            }
        }
        let bytes = Self::alloc_size((*this).count);
        mctx.free(this as *mut u8, bytes);
        true
    }
}

// =============================================================================
// Devices
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePipelineRef {
    pub pipeline: u64,
    pub weight: u64,
}

/// Pipeline selection descriptor for one device id. The weighted reference
/// array follows inline.
#[repr(C)]
pub struct Device {
    pipeline_count: u64,
    total_weight: u64,
}

impl Device {
    pub const fn alloc_size(pipeline_count: u64) -> u64 {
        size_of::<Self>() as u64 + pipeline_count * size_of::<DevicePipelineRef>() as u64
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size(refs.len())` writable bytes.
    pub unsafe fn init(this: *mut Self, refs: &[DevicePipelineRef]) {
        (*this).pipeline_count = refs.len() as u64;
        (*this).total_weight = refs.iter().map(|r| r.weight).sum();
        let arr = (this as *mut u8).add(size_of::<Self>()) as *mut DevicePipelineRef;
        for (i, &r) in refs.iter().enumerate() {
            arr.add(i).write(r);
        }
    }

    #[inline]
    pub fn pipeline_count(&self) -> u64 {
        self.pipeline_count
    }

    #[inline]
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// # Safety
    ///
    /// The device must have been initialised.
    #[inline]
    pub unsafe fn refs(&self) -> &[DevicePipelineRef] {
        let arr = (self as *const Self as *const u8).add(size_of::<Self>())
            as *const DevicePipelineRef;
        core::slice::from_raw_parts(arr, self.pipeline_count as usize)
    }

    /// Pick a pipeline for a packet hash, weighted by the stored weights.
    ///
    /// # Safety
    ///
    /// The device must have been initialised.
    pub unsafe fn select_pipeline(&self, hash: u32) -> Option<u64> {
        if self.total_weight == 0 {
            return None;
        }
        let mut w = hash as u64 % self.total_weight;
        for r in self.refs() {
            if w < r.weight {
                return Some(r.pipeline);
            }
            w -= r.weight;
        }
        None
    }
}

/// Immutable array of device descriptors, indexed by device id; owns the
/// descriptors it holds. Unassigned ids have null slots.
#[repr(C)]
pub struct DeviceRegistry {
    refcnt: AtomicU64,
    count: u64,
}

impl DeviceRegistry {
    pub const fn alloc_size(count: u64) -> u64 {
        size_of::<Self>() as u64 + count * size_of::<RelPtr<Device>>() as u64
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size(count)` zeroed bytes.
    pub unsafe fn init(this: *mut Self, count: u64) {
        (*this).refcnt = AtomicU64::new(1);
        (*this).count = count;
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// # Safety
    ///
    /// `idx` must be below [`count`](Self::count).
    #[inline]
    pub unsafe fn slot(&self, idx: u64) -> &RelPtr<Device> {
        let base =
            (self as *const Self as *const u8).add(size_of::<Self>()) as *const RelPtr<Device>;
        &*base.add(idx as usize)
    }

    /// Descriptor for a device id, or null when unassigned.
    ///
    /// # Safety
    ///
    /// The registry must have been initialised.
    pub unsafe fn device(&self, device_id: u32) -> *mut Device {
        if (device_id as u64) >= self.count {
            return core::ptr::null_mut();
        }
        self.slot(device_id as u64).load()
    }

    pub fn acquire(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `this` and its devices must have been allocated from `mctx`.
    pub unsafe fn release(this: *mut Self, mctx: &MemoryContext) -> bool {
        if (*this).refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        for idx in 0..(*this).count {
            let d = (*this).slot(idx).load();
            if !d.is_null() {
                mctx.free(d as *mut u8, Device::alloc_size((*d).pipeline_count));
            }
        }
        let bytes = Self::alloc_size((*this).count);
        mctx.free(this as *mut u8, bytes);
        true
    }
}

// =============================================================================
// Configuration generation
// =============================================================================

#[repr(C)]
pub struct ConfigGen {
    number: u64,
    modules: RelPtr<ModuleRegistry>,
    pipelines: RelPtr<PipelineRegistry>,
    devices: RelPtr<DeviceRegistry>,
    counters: RelPtr<CounterStorage>,
    prev: RelPtr<ConfigGen>,
    removed: RelPtr<ModuleData>,
}

impl ConfigGen {
    pub const fn alloc_size() -> u64 {
        size_of::<Self>() as u64
    }

    /// # Safety
    ///
    /// `this` must point to `alloc_size()` zeroed bytes.
    pub unsafe fn init(this: *mut Self, number: u64) {
        (*this).number = number;
    }

    #[inline]
    /// Strictly monotonic generation number.
    pub fn number(&self) -> u64 {
        self.number
    }

    #[inline]
    pub fn modules(&self) -> *mut ModuleRegistry {
        self.modules.load()
    }

    #[inline]
    pub fn set_modules(&self, reg: *mut ModuleRegistry) {
        self.modules.store(reg);
    }

    #[inline]
    pub fn pipelines(&self) -> *mut PipelineRegistry {
        self.pipelines.load()
    }

    #[inline]
    pub fn set_pipelines(&self, reg: *mut PipelineRegistry) {
        self.pipelines.store(reg);
    }

    #[inline]
    pub fn devices(&self) -> *mut DeviceRegistry {
        self.devices.load()
    }

    #[inline]
    pub fn set_devices(&self, reg: *mut DeviceRegistry) {
        self.devices.store(reg);
    }

    #[inline]
    pub fn counter_storage(&self) -> *mut CounterStorage {
        self.counters.load()
    }

    #[inline]
    pub fn set_counter_storage(&self, storage: *mut CounterStorage) {
        self.counters.store(storage);
    }

    /// Previous generation; only maintained while pending reclamation.
    #[inline]
    pub fn prev_ptr(&self) -> *mut ConfigGen {
        self.prev.load()
    }

    #[inline]
    pub fn set_prev(&self, prev: *mut ConfigGen) {
        self.prev.store(prev);
    }

    /// Module data records this publication removed from the registry,
    /// chained through their free-list links until reclamation.
    #[inline]
    pub fn removed_head(&self) -> *mut ModuleData {
        self.removed.load()
    }

    /// # Safety
    ///
    /// `m` must be a record absent from this generation's module registry.
    pub unsafe fn push_removed(&self, m: *mut ModuleData) {
        (*m).set_link(self.removed.load());
        self.removed.store(m);
    }

    /// Detach the removed-record list for splicing onto agent free lists.
    #[inline]
    pub fn take_removed(&self) -> *mut ModuleData {
        let head = self.removed.load();
        self.removed.store(core::ptr::null_mut());
        head
    }
}

// =============================================================================
// Controlplane zone
// =============================================================================

#[repr(C)]
pub struct CpConfig {
    lock: PidLock,
    _pad0: u32,
    instance_count: u64,
    gen_counter: AtomicU64,
    current: RelPtr<ConfigGen>,
    retired: RelPtr<ConfigGen>,
    agents: RelPtr<AgentRecord>,
    agent_count: AtomicU64,
    counters: CounterRegistry,
    balloc: BlockAllocator,
    mctx: MemoryContext,
}

/// Entries the zone counter registry starts with.
const COUNTER_REGISTRY_SEED: u64 = 64;

impl CpConfig {
    /// Initialise the controlplane sub-zone in place; the arena spans from
    /// the end of the struct to `zone_size`.
    ///
    /// # Safety
    ///
    /// `this` must point to `zone_size` writable bytes, 64-byte aligned,
    /// not yet visible to other processes.
    pub unsafe fn init(this: *mut Self, zone_size: u64, instance_count: u64) -> ShmResult<()> {
        let hdr = align_up_u64(size_of::<Self>() as u64, 64);
        if zone_size <= hdr + 4096 {
            return Err(ShmError::InvalidArgument);
        }
        let c = &mut *this;
        c.lock = PidLock::new();
        c._pad0 = 0;
        c.instance_count = instance_count;
        c.gen_counter = AtomicU64::new(0);
        c.current = RelPtr::null();
        c.retired = RelPtr::null();
        c.agents = RelPtr::null();
        c.agent_count = AtomicU64::new(0);

        let arena = (this as *mut u8).add(hdr as usize);
        BlockAllocator::init(&mut c.balloc as *mut _, arena, zone_size - hdr);
        MemoryContext::init(&mut c.mctx as *mut _, "controlplane", &mut c.balloc as *mut _);
        CounterRegistry::init(&mut c.counters as *mut _, &c.mctx, COUNTER_REGISTRY_SEED)
            .map_err(|_| ShmError::OutOfMemory)?;
        Ok(())
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
    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }

    /// Counter storage instances per zone (one per dataplane worker).
    #[inline]
    pub fn instance_count(&self) -> u64 {
        self.instance_count
    }

    /// Number of the most recently published generation.
    #[inline]
    pub fn gen_counter(&self) -> u64 {
        self.gen_counter.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_gen_counter(&self, value: u64) {
        self.gen_counter.store(value, Ordering::Release);
    }

    /// Current configuration generation, or null before the first publish.
    #[inline]
    pub fn current(&self) -> *mut ConfigGen {
        self.current.load()
    }

    /// Atomically publish a fully constructed generation.
    #[inline]
    pub fn set_current(&self, generation: *mut ConfigGen) {
        self.current.store(generation);
    }

    /// Head of the retired-generation chain pending reclamation.
    #[inline]
    pub fn retired(&self) -> *mut ConfigGen {
        self.retired.load()
    }

    #[inline]
    pub fn set_retired(&self, generation: *mut ConfigGen) {
        self.retired.store(generation);
    }

    #[inline]
    pub fn agent_count(&self) -> u64 {
        self.agent_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn agents_head(&self) -> *mut AgentRecord {
        self.agents.load()
    }

    /// Link a fresh agent record into the zone agent list. Caller holds the
    /// zone lock.
    ///
    /// # Safety
    ///
    /// `agent` must be an initialised record inside this zone.
    pub unsafe fn link_agent(&self, agent: *mut AgentRecord) {
        (*agent).set_next(self.agents.load());
        self.agents.store(agent);
        self.agent_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink an agent record. Caller holds the zone lock. Returns false
    /// when the record is not on the list.
    ///
    /// # Safety
    ///
    /// `agent` must be a record previously linked into this zone.
    pub unsafe fn unlink_agent(&self, agent: *mut AgentRecord) -> bool {
        let mut slot: *const RelPtr<AgentRecord> = &self.agents;
        loop {
            let current = (*slot).load();
            if current.is_null() {
                return false;
            }
            if current == agent {
                (*slot).store((*current).next_ptr());
                self.agent_count.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            slot = (*current).next_slot();
        }
    }

    /// Find an attached agent by name and pid. Caller holds the zone lock.
    pub fn find_agent(&self, name: &Name80, pid: u32) -> *mut AgentRecord {
        let mut cur = self.agents.load();
        while !cur.is_null() {
            let a = unsafe { &*cur };
            if a.pid() == pid && a.name_raw() == name {
                return cur;
            }
            cur = a.next_ptr();
        }
        core::ptr::null_mut()
    }
}
