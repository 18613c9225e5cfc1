//! Dataplane instance bootstrap and the worker dispatch loop.
//!
//! `DpInstance::create` truncates and reinitialises the shared segment,
//! populates one zone per NUMA bit and seals the module table. Each worker
//! thread claims a [`Worker`] over one cache-aligned slot and drives
//! [`process`](Worker::process) per packet batch:
//!
//! 1. one load of the current-generation pointer,
//! 2. per-packet pipeline selection through the device's weighted map,
//! 3. the pipeline's module chain with an output→input swap after each
//!    module; `bypass` short-circuits, `drops` collect,
//! 4. a single release store of the observed generation number — the
//!    quiescence signal the publisher waits on.
//!
//! The worker never allocates from the zone and never takes the zone lock.
//! The per-pipeline scratch fronts are process-local and only resized when
//! a new generation changes the pipeline count.

use std::path::Path;
use std::sync::Arc;

use flowplane_counters::CounterHandle;
use flowplane_shm::cp::{ModuleRegistry, Pipeline};
use flowplane_shm::dp::{DpConfig, DpWorker};
use flowplane_shm::segment::SharedMemory;
use log::info;

use crate::error::{DpError, DpResult};
use crate::module::{ModuleDataView, ModuleDef, ModuleHandler};
use crate::packet::PacketFront;

#[derive(Clone, Copy, Debug)]
pub struct DpOptions {
    /// Bytes per zone; must be page-aligned.
    pub storage_size: u64,
    /// Zone slots in the segment (one per NUMA node).
    pub zone_count: u32,
    /// Bitmap of zones to populate.
    pub numa_map: u32,
    /// Bytes of each zone reserved for the dataplane side; page-aligned.
    pub dp_arena_size: u64,
    /// Worker slots (and counter instances) per zone.
    pub worker_count: u32,
}

impl Default for DpOptions {
    fn default() -> Self {
        Self {
            storage_size: 16 << 20,
            zone_count: 1,
            numa_map: 0x1,
            dp_arena_size: 2 << 20,
            worker_count: 1,
        }
    }
}

pub struct DpInstance {
    shm: Arc<SharedMemory>,
    handlers: Vec<ModuleHandler>,
}

impl DpInstance {
    /// Create the segment, populate the zones of `opts.numa_map` and seal
    /// the module table. A fresh start always truncates: nothing persists
    /// across dataplane restarts.
    pub fn create(path: &Path, opts: &DpOptions, modules: &[ModuleDef]) -> DpResult<DpInstance> {
        if opts.numa_map == 0
            || opts.zone_count == 0
            || opts.zone_count > 32
            || (opts.numa_map as u64) >> opts.zone_count != 0
        {
            return Err(DpError::InvalidArgument);
        }
        let shm = SharedMemory::create(path, opts.storage_size, opts.zone_count)?;
        let names: Vec<&str> = modules.iter().map(|m| m.name).collect();
        for numa in 0..opts.zone_count {
            if opts.numa_map & (1 << numa) == 0 {
                continue;
            }
            let zone = shm.zone_base(numa)?;
            unsafe {
                DpConfig::init(
                    zone,
                    opts.storage_size,
                    opts.dp_arena_size,
                    opts.worker_count,
                    &names,
                )?;
            }
            shm.header().mark_zone(numa);
        }
        info!(
            "dataplane up: {} zones, {} workers each, {} module kinds",
            opts.numa_map.count_ones(),
            opts.worker_count,
            modules.len()
        );
        Ok(DpInstance {
            shm: Arc::new(shm),
            handlers: modules.iter().map(|m| m.handler).collect(),
        })
    }

    #[inline]
    pub fn shm(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    /// Claim worker slot `worker_idx` of zone `numa_idx` for the calling
    /// thread.
    pub fn worker(&self, numa_idx: u32, worker_idx: u64) -> DpResult<Worker<'_>> {
        let dp = self.shm.dp_config(numa_idx)?;
        let dp = unsafe { &*dp };
        let slot = dp
            .worker(worker_idx)
            .ok_or(DpError::NoSuchWorker { idx: worker_idx })?;
        if !slot.claim(std::process::id()) {
            return Err(DpError::WorkerBusy { idx: worker_idx });
        }
        Ok(Worker {
            instance: self,
            dp,
            slot,
            scratch: Vec::new(),
        })
    }
}

/// One worker thread's view of a zone. Pinned to a slot; released on drop.
pub struct Worker<'a> {
    instance: &'a DpInstance,
    dp: &'a DpConfig,
    slot: &'a DpWorker,
    scratch: Vec<PacketFront>,
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        self.slot.release_claim();
    }
}

impl Worker<'_> {
    /// Counter instance index owned by this worker.
    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.slot.idx()
    }

    #[inline]
    pub fn iterations(&self) -> u64 {
        self.slot.iterations()
    }

    /// Latest generation this worker has observed.
    #[inline]
    pub fn observed_gen(&self) -> u64 {
        self.slot.generation()
    }

    /// An empty iteration: observe the current generation and publish
    /// quiescence without touching packets.
    pub fn observe(&mut self) {
        unsafe {
            let cp = &*self.dp.cp_config();
            let current = cp.current();
            if !current.is_null() {
                self.slot.store_generation((*current).number());
            }
        }
        self.slot.bump_iterations();
    }

    /// Resolve a counter against the currently observed generation's
    /// storage. Lock-free; `None` until the counter is linked.
    pub fn counter(&self, name: &str, size: u64) -> Option<CounterHandle> {
        unsafe {
            let cp = &*self.dp.cp_config();
            let current = cp.current();
            if current.is_null() {
                return None;
            }
            let storage = (*current).counter_storage();
            if storage.is_null() {
                return None;
            }
            let id = cp.counters().lookup(name, size)?;
            CounterHandle::resolve(storage, cp.counters(), id)
        }
    }

    /// Run one dispatch iteration for a batch received on `device_id`:
    /// consumes `front.input`, fills `front.output` (including bypassed
    /// packets) and `front.drops`. The caller routes output to the device
    /// and releases drops.
    pub fn process(&mut self, device_id: u32, front: &mut PacketFront) {
        unsafe {
            let cp = &*self.dp.cp_config();
            let gen_ptr = cp.current();
            if gen_ptr.is_null() {
                // No configuration yet: nothing can be forwarded.
                front.drops.append(&mut front.input);
                self.slot.bump_iterations();
                return;
            }
            let current = &*gen_ptr;

            let preg = current.pipelines();
            let pipeline_count = if preg.is_null() { 0 } else { (*preg).count() };
            if self.scratch.len() < pipeline_count as usize {
                // Grows only when a new generation added pipelines; the
                // steady-state path never allocates.
                self.scratch
                    .resize_with(pipeline_count as usize, PacketFront::new);
            }

            let dreg = current.devices();
            let device = if dreg.is_null() {
                core::ptr::null_mut()
            } else {
                (*dreg).device(device_id)
            };
            if device.is_null() || pipeline_count == 0 {
                front.drops.append(&mut front.input);
            } else {
                // Weighted per-packet pipeline selection.
                loop {
                    let pkt = front.input.pop();
                    if pkt.is_null() {
                        break;
                    }
                    match (*device).select_pipeline((*pkt).hash) {
                        Some(idx) if idx < pipeline_count => {
                            self.scratch[idx as usize].input.push(pkt);
                        }
                        _ => front.drops.push(pkt),
                    }
                }

                let mreg = current.modules();
                for idx in 0..pipeline_count {
                    let sub = &mut self.scratch[idx as usize];
                    if sub.input.is_empty() {
                        continue;
                    }
                    let pipeline = (*preg).pipeline(idx);
                    run_chain(&self.instance.handlers, mreg, &*pipeline, sub);
                    // After the final swap the surviving packets sit in
                    // input; bypassed packets rejoin the output here.
                    front.output.append(&mut sub.input);
                    front.output.append(&mut sub.bypass);
                    front.drops.append(&mut sub.drops);
                }
            }

            // Quiescence: the only shared-state write on this path besides
            // counters.
            self.slot.store_generation(current.number());
        }
        self.slot.bump_iterations();
    }
}

unsafe fn run_chain(
    handlers: &[ModuleHandler],
    mreg: *mut ModuleRegistry,
    pipeline: &Pipeline,
    front: &mut PacketFront,
) {
    for &pos in pipeline.modules() {
        if front.input.is_empty() {
            break;
        }
        let m = (*mreg).module(pos);
        if m.is_null() {
            continue;
        }
        let view = ModuleDataView::new(m);
        handlers[(*m).index() as usize](&view, front);
        front.switch();
    }
}
