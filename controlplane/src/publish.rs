//! Configuration publication.
//!
//! All mutation of the module, pipeline and device registries funnels
//! through the publication skeleton in this module:
//!
//! 1. take the zone lock (PID-valued compare-and-set),
//! 2. load the current generation,
//! 3. allocate a new generation node,
//! 4. share the unchanged registries by offset (refcount),
//! 5. rebuild the changed registry copy-on-write,
//! 6. publish with a single atomic offset store,
//! 7. wait until every worker has observed the new generation,
//! 8. splice superseded module data onto their owning agents and free the
//!    old generation,
//! 9. unlock.
//!
//! Building the new generation (steps 3–5) also runs the counter upkeep:
//! expire entries that fell out of the GC window, compact the registry,
//! link offsets for the newly registered, and spawn or share the storage
//! snapshot.
//!
//! Any failure before step 6 releases everything that was allocated and
//! leaves the current generation untouched; readers never observe a
//! partially built generation. The quiescence wait blocks indefinitely by
//! default; with a configured deadline a timed-out publication parks the
//! superseded generation on the zone's retired chain, which every later
//! publication drains once the slowest worker has moved past it.

use core::hint::spin_loop;
use std::time::{Duration, Instant};

use flowplane_counters::{COUNTER_GC_GENERATIONS, CounterStorage};
use flowplane_lib::{Name80, PidLockGuard};
use flowplane_shm::cp::{
    ConfigGen, CpConfig, Device, DevicePipelineRef, DeviceRegistry, ModuleRegistry, Pipeline,
    PipelineRegistry,
};
use flowplane_shm::dp::DpConfig;
use flowplane_shm::module::{AgentRecord, ModuleData};
use log::{error, info, warn};

use crate::agent::{DeviceConfig, PipelineConfig};
use crate::error::{CpError, CpResult};

#[derive(Clone, Copy, Debug, Default)]
pub struct PublishOptions {
    /// Bound on the quiescence wait. `None` (the default) blocks until
    /// every worker has observed the new generation.
    pub quiescence_deadline: Option<Duration>,
}

// =============================================================================
// Module updates
// =============================================================================

pub(crate) unsafe fn update_modules(
    dp: &DpConfig,
    cp: &CpConfig,
    mods: &[*mut ModuleData],
    opts: &PublishOptions,
) -> CpResult<()> {
    for &m in mods {
        if m.is_null() || (*m).index() as u64 >= dp.module_count() {
            return Err(CpError::InvalidArgument);
        }
    }

    let guard = cp.lock().lock();
    reclaim_retired(dp, cp);

    let old_gen = cp.current();
    let next = cp.gen_counter() + 1;
    let old_reg = if old_gen.is_null() {
        core::ptr::null_mut()
    } else {
        (*old_gen).modules()
    };
    let old_count = if old_reg.is_null() { 0 } else { (*old_reg).count() };

    // Size the new registry: replacements keep their slot, genuinely new
    // (kind, name) pairs append. The batch itself may carry duplicates.
    let mut appended: Vec<(u32, Name80)> = Vec::new();
    for &m in mods {
        let key = ((*m).index(), *(*m).name_raw());
        let in_old = !old_reg.is_null() && (*old_reg).lookup(key.0, &key.1).is_some();
        if !in_old && !appended.contains(&key) {
            appended.push(key);
        }
    }
    let new_count = old_count + appended.len() as u64;

    // Allocate everything before mutating shared state; an abort leaves the
    // current generation untouched.
    let gen_node = cp_alloc(cp, ConfigGen::alloc_size())? as *mut ConfigGen;
    ConfigGen::init(gen_node, next);
    let new_reg = match cp_alloc(cp, ModuleRegistry::alloc_size(new_count)) {
        Ok(p) => p as *mut ModuleRegistry,
        Err(e) => {
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    ModuleRegistry::init(new_reg, new_count);
    let storage = match spawn_storage(cp, old_gen, next) {
        Ok(s) => s,
        Err(e) => {
            ModuleRegistry::release(new_reg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };

    // Copy the existing slots, then merge the batch.
    for idx in 0..old_count {
        (*new_reg).slot(idx).store((*old_reg).module(idx));
    }
    let mut append_at = old_count;
    for &m in mods {
        match (*new_reg).lookup((*m).index(), (*m).name_raw()) {
            Some(idx) => {
                let old_m = (*new_reg).module(idx);
                if old_m != m {
                    // Chain the superseded record; it stays live until no
                    // worker can still reference it.
                    (*m).set_prev(old_m);
                    (*(*old_m).agent_ptr()).dec_loaded();
                    (*(*m).agent_ptr()).inc_loaded();
                    (*new_reg).slot(idx).store(m);
                }
            }
            None => {
                (*new_reg).slot(append_at).store(m);
                append_at += 1;
                (*(*m).agent_ptr()).inc_loaded();
            }
        }
        (*m).set_generation(next);
    }

    (*gen_node).set_modules(new_reg);
    share_pipelines(gen_node, old_gen);
    share_devices(gen_node, old_gen);
    (*gen_node).set_counter_storage(storage);

    publish(cp, gen_node, next);
    info!("generation {next}: {new_count} modules ({} new)", appended.len());
    finish(dp, cp, old_gen, next, opts, guard)
}

// =============================================================================
// Pipeline updates
// =============================================================================

pub(crate) unsafe fn update_pipelines(
    dp: &DpConfig,
    cp: &CpConfig,
    cfgs: &[PipelineConfig],
    opts: &PublishOptions,
) -> CpResult<()> {
    let guard = cp.lock().lock();
    reclaim_retired(dp, cp);

    let old_gen = cp.current();
    let next = cp.gen_counter() + 1;
    let module_reg = if old_gen.is_null() {
        core::ptr::null_mut()
    } else {
        (*old_gen).modules()
    };

    // Resolve every (type, name) reference before allocating anything: the
    // kind through the immutable dataplane table, the instance through the
    // module registry the new generation will share.
    let mut resolved: Vec<Vec<u64>> = Vec::with_capacity(cfgs.len());
    for cfg in cfgs {
        let mut positions = Vec::with_capacity(cfg.modules.len());
        for (kind, name) in &cfg.modules {
            let Some(index) = dp.lookup_module(kind) else {
                warn!("pipeline references unknown module type {kind:?}");
                return Err(CpError::NotFound);
            };
            let name80 = Name80::new(name).ok_or(CpError::InvalidArgument)?;
            let pos = if module_reg.is_null() {
                None
            } else {
                (*module_reg).lookup(index, &name80)
            };
            let Some(pos) = pos else {
                warn!("pipeline references unknown module instance {kind}:{name}");
                return Err(CpError::NotFound);
            };
            positions.push(pos);
        }
        resolved.push(positions);
    }

    let gen_node = cp_alloc(cp, ConfigGen::alloc_size())? as *mut ConfigGen;
    ConfigGen::init(gen_node, next);
    let new_preg = match build_pipeline_registry(cp, &resolved) {
        Ok(p) => p,
        Err(e) => {
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    let storage = match spawn_storage(cp, old_gen, next) {
        Ok(s) => s,
        Err(e) => {
            PipelineRegistry::release(new_preg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };

    (*gen_node).set_pipelines(new_preg);
    share_modules(gen_node, old_gen);
    share_devices(gen_node, old_gen);
    (*gen_node).set_counter_storage(storage);

    publish(cp, gen_node, next);
    info!("generation {next}: {} pipelines", cfgs.len());
    finish(dp, cp, old_gen, next, opts, guard)
}

// =============================================================================
// Device updates
// =============================================================================

pub(crate) unsafe fn update_devices(
    dp: &DpConfig,
    cp: &CpConfig,
    cfgs: &[DeviceConfig],
    opts: &PublishOptions,
) -> CpResult<()> {
    let guard = cp.lock().lock();
    reclaim_retired(dp, cp);

    let old_gen = cp.current();
    let next = cp.gen_counter() + 1;
    let pipe_count = if old_gen.is_null() {
        0
    } else {
        let p = (*old_gen).pipelines();
        if p.is_null() { 0 } else { (*p).count() }
    };
    for cfg in cfgs {
        for &(pipeline, _) in &cfg.pipelines {
            if pipeline >= pipe_count {
                warn!(
                    "device {} references unknown pipeline {pipeline}",
                    cfg.device_id
                );
                return Err(CpError::NotFound);
            }
        }
    }

    // One descriptor per device id: updated ids from the batch, the rest
    // carried over from the old registry.
    let old_dreg = if old_gen.is_null() {
        core::ptr::null_mut()
    } else {
        (*old_gen).devices()
    };
    let old_count = if old_dreg.is_null() { 0 } else { (*old_dreg).count() };
    let max_id = cfgs.iter().map(|c| c.device_id as u64 + 1).max().unwrap_or(0);
    let new_count = old_count.max(max_id);

    let mut plan: Vec<Option<Vec<DevicePipelineRef>>> = Vec::with_capacity(new_count as usize);
    for id in 0..new_count {
        if let Some(cfg) = cfgs.iter().find(|c| c.device_id as u64 == id) {
            let refs = cfg
                .pipelines
                .iter()
                .map(|&(pipeline, weight)| DevicePipelineRef { pipeline, weight })
                .collect();
            plan.push(Some(refs));
        } else if !old_dreg.is_null() {
            let old_d = (*old_dreg).device(id as u32);
            if old_d.is_null() {
                plan.push(None);
            } else {
                plan.push(Some((*old_d).refs().to_vec()));
            }
        } else {
            plan.push(None);
        }
    }

    let gen_node = cp_alloc(cp, ConfigGen::alloc_size())? as *mut ConfigGen;
    ConfigGen::init(gen_node, next);
    let new_dreg = match build_device_registry(cp, &plan) {
        Ok(d) => d,
        Err(e) => {
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    let storage = match spawn_storage(cp, old_gen, next) {
        Ok(s) => s,
        Err(e) => {
            DeviceRegistry::release(new_dreg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };

    (*gen_node).set_devices(new_dreg);
    share_modules(gen_node, old_gen);
    share_pipelines(gen_node, old_gen);
    (*gen_node).set_counter_storage(storage);

    publish(cp, gen_node, next);
    info!("generation {next}: {new_count} devices");
    finish(dp, cp, old_gen, next, opts, guard)
}

// =============================================================================
// Agent module removal (detach path)
// =============================================================================

/// Publish a generation with every module of `agent` removed. Pipelines
/// referencing a removed module are dropped and the survivors' positions
/// remapped; device references to dropped pipelines are filtered out. Always
/// blocks for quiescence: the records must be safely spliced onto the
/// agent's free list before the caller may reclaim them.
pub(crate) unsafe fn remove_agent_modules(
    dp: &DpConfig,
    cp: &CpConfig,
    agent: *mut AgentRecord,
) -> CpResult<()> {
    let guard = cp.lock().lock();
    reclaim_retired(dp, cp);

    let old_gen = cp.current();
    if old_gen.is_null() {
        return Ok(());
    }
    let old_reg = (*old_gen).modules();
    if old_reg.is_null() {
        return Ok(());
    }

    // Partition the registry into survivors (with their new, compacted
    // positions) and this agent's records.
    let old_count = (*old_reg).count();
    let mut pos_map: Vec<Option<u64>> = Vec::with_capacity(old_count as usize);
    let mut survivors: Vec<*mut ModuleData> = Vec::new();
    let mut removed: Vec<*mut ModuleData> = Vec::new();
    for idx in 0..old_count {
        let m = (*old_reg).module(idx);
        if !m.is_null() && (*m).agent_ptr() == agent {
            removed.push(m);
            pos_map.push(None);
        } else {
            pos_map.push(Some(survivors.len() as u64));
            survivors.push(m);
        }
    }
    if removed.is_empty() {
        return Ok(());
    }
    let next = cp.gen_counter() + 1;

    // Compacting the registry shifts positions, so pipelines are rebuilt:
    // one that references a removed module is dropped, the rest remap.
    let old_preg = (*old_gen).pipelines();
    let mut kept_pipelines: Vec<Vec<u64>> = Vec::new();
    let mut pipe_map: Vec<Option<u64>> = Vec::new();
    if !old_preg.is_null() {
        for idx in 0..(*old_preg).count() {
            let p = (*old_preg).pipeline(idx);
            let remapped: Option<Vec<u64>> = (*p)
                .modules()
                .iter()
                .map(|&pos| pos_map[pos as usize])
                .collect();
            match remapped {
                Some(positions) => {
                    pipe_map.push(Some(kept_pipelines.len() as u64));
                    kept_pipelines.push(positions);
                }
                None => pipe_map.push(None),
            }
        }
    }

    // Devices keep their ids; references to dropped pipelines are filtered.
    let old_dreg = (*old_gen).devices();
    let device_count = if old_dreg.is_null() { 0 } else { (*old_dreg).count() };
    let mut plan: Vec<Option<Vec<DevicePipelineRef>>> = Vec::with_capacity(device_count as usize);
    for id in 0..device_count {
        let d = (*old_dreg).slot(id).load();
        if d.is_null() {
            plan.push(None);
            continue;
        }
        let refs: Vec<DevicePipelineRef> = (*d)
            .refs()
            .iter()
            .filter_map(|r| {
                pipe_map
                    .get(r.pipeline as usize)
                    .and_then(|&mapped| mapped)
                    .map(|pipeline| DevicePipelineRef {
                        pipeline,
                        weight: r.weight,
                    })
            })
            .collect();
        plan.push(if refs.is_empty() { None } else { Some(refs) });
    }

    let gen_node = cp_alloc(cp, ConfigGen::alloc_size())? as *mut ConfigGen;
    ConfigGen::init(gen_node, next);
    let new_reg = match cp_alloc(cp, ModuleRegistry::alloc_size(survivors.len() as u64)) {
        Ok(p) => p as *mut ModuleRegistry,
        Err(e) => {
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    ModuleRegistry::init(new_reg, survivors.len() as u64);
    let new_preg = match build_pipeline_registry(cp, &kept_pipelines) {
        Ok(p) => p,
        Err(e) => {
            ModuleRegistry::release(new_reg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    let new_dreg = match build_device_registry(cp, &plan) {
        Ok(d) => d,
        Err(e) => {
            PipelineRegistry::release(new_preg, cp.mctx());
            ModuleRegistry::release(new_reg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };
    let storage = match spawn_storage(cp, old_gen, next) {
        Ok(s) => s,
        Err(e) => {
            DeviceRegistry::release(new_dreg, cp.mctx());
            PipelineRegistry::release(new_preg, cp.mctx());
            ModuleRegistry::release(new_reg, cp.mctx());
            free_gen_node(cp, gen_node);
            return Err(e);
        }
    };

    for (idx, &m) in survivors.iter().enumerate() {
        (*new_reg).slot(idx as u64).store(m);
    }
    for &m in &removed {
        (*agent).dec_loaded();
        (*gen_node).push_removed(m);
    }

    (*gen_node).set_modules(new_reg);
    (*gen_node).set_pipelines(new_preg);
    (*gen_node).set_devices(new_dreg);
    (*gen_node).set_counter_storage(storage);

    publish(cp, gen_node, next);
    info!(
        "generation {next}: removed {} modules of agent {}",
        removed.len(),
        (*agent).name()
    );
    finish(dp, cp, old_gen, next, &PublishOptions::default(), guard)
}

// =============================================================================
// Shared machinery
// =============================================================================

unsafe fn cp_alloc(cp: &CpConfig, size: u64) -> CpResult<*mut u8> {
    let p = cp.mctx().alloc_zeroed(size);
    if p.is_null() {
        Err(CpError::OutOfMemory)
    } else {
        Ok(p)
    }
}

unsafe fn free_gen_node(cp: &CpConfig, gen_node: *mut ConfigGen) {
    cp.mctx().free(gen_node as *mut u8, ConfigGen::alloc_size());
}

unsafe fn share_modules(gen_node: *mut ConfigGen, old_gen: *mut ConfigGen) {
    if old_gen.is_null() {
        return;
    }
    let reg = (*old_gen).modules();
    if !reg.is_null() {
        (*reg).acquire();
        (*gen_node).set_modules(reg);
    }
}

unsafe fn share_pipelines(gen_node: *mut ConfigGen, old_gen: *mut ConfigGen) {
    if old_gen.is_null() {
        return;
    }
    let reg = (*old_gen).pipelines();
    if !reg.is_null() {
        (*reg).acquire();
        (*gen_node).set_pipelines(reg);
    }
}

unsafe fn share_devices(gen_node: *mut ConfigGen, old_gen: *mut ConfigGen) {
    if old_gen.is_null() {
        return;
    }
    let reg = (*old_gen).devices();
    if !reg.is_null() {
        (*reg).acquire();
        (*gen_node).set_devices(reg);
    }
}

/// Counter registry upkeep at publication time: expire counters whose
/// stamp fell out of the GC window (owners refresh by re-registering),
/// compact the registry when anything expired, then assign offsets to the
/// newly registered. Returns the number of counters linked.
unsafe fn refresh_counters(cp: &CpConfig, next: u64) -> CpResult<u64> {
    let registry = cp.counters();
    let expired = registry.expire(next.saturating_sub(COUNTER_GC_GENERATIONS));
    if expired > 0 {
        info!("expired {expired} stale counters, compacting the registry");
        registry
            .compact(cp.mctx())
            .map_err(|_| CpError::OutOfMemory)?;
    }
    Ok(registry.link_offsets(next))
}

/// Link unlinked counters and pick the storage snapshot for the new
/// generation: shared when nothing new was linked, freshly spawned (block
/// reuse inside) otherwise.
unsafe fn spawn_storage(
    cp: &CpConfig,
    old_gen: *mut ConfigGen,
    next: u64,
) -> CpResult<*mut CounterStorage> {
    let linked = refresh_counters(cp, next)?;
    let old = if old_gen.is_null() {
        core::ptr::null_mut()
    } else {
        (*old_gen).counter_storage()
    };
    if linked == 0 && !old.is_null() {
        CounterStorage::acquire(old);
        return Ok(old);
    }
    CounterStorage::spawn(cp.mctx(), old, cp.counters(), cp.instance_count())
        .map_err(|_| CpError::OutOfMemory)
}

unsafe fn build_pipeline_registry(
    cp: &CpConfig,
    resolved: &[Vec<u64>],
) -> CpResult<*mut PipelineRegistry> {
    let count = resolved.len() as u64;
    let preg = cp_alloc(cp, PipelineRegistry::alloc_size(count))? as *mut PipelineRegistry;
    PipelineRegistry::init(preg, count);
    for (idx, positions) in resolved.iter().enumerate() {
        let p = match cp_alloc(cp, Pipeline::alloc_size(positions.len() as u64)) {
            Ok(p) => p as *mut Pipeline,
            Err(e) => {
                // Frees the pipelines already hung off the registry.
                PipelineRegistry::release(preg, cp.mctx());
                return Err(e);
            }
        };
        Pipeline::init(p, positions);
        (*preg).slot(idx as u64).store(p);
    }
    Ok(preg)
}

unsafe fn build_device_registry(
    cp: &CpConfig,
    plan: &[Option<Vec<DevicePipelineRef>>],
) -> CpResult<*mut DeviceRegistry> {
    let count = plan.len() as u64;
    let dreg = cp_alloc(cp, DeviceRegistry::alloc_size(count))? as *mut DeviceRegistry;
    DeviceRegistry::init(dreg, count);
    for (id, refs) in plan.iter().enumerate() {
        let Some(refs) = refs else { continue };
        let d = match cp_alloc(cp, Device::alloc_size(refs.len() as u64)) {
            Ok(p) => p as *mut Device,
            Err(e) => {
                DeviceRegistry::release(dreg, cp.mctx());
                return Err(e);
            }
        };
        Device::init(d, refs);
        (*dreg).slot(id as u64).store(d);
    }
    Ok(dreg)
}

/// Step 6: readers observe either the old or the fully built new
/// generation, never anything in between.
unsafe fn publish(cp: &CpConfig, gen_node: *mut ConfigGen, next: u64) {
    cp.set_current(gen_node);
    cp.set_gen_counter(next);
}

/// Steps 7–9 for a publication that superseded `old_gen`.
unsafe fn finish(
    dp: &DpConfig,
    cp: &CpConfig,
    old_gen: *mut ConfigGen,
    next: u64,
    opts: &PublishOptions,
    guard: PidLockGuard<'_>,
) -> CpResult<()> {
    if old_gen.is_null() {
        // First publication: nothing to reclaim, and no reader can hold
        // older state.
        drop(guard);
        return Ok(());
    }
    match wait_quiescence(dp, next, opts.quiescence_deadline) {
        Ok(()) => {
            splice_quiesced(dp, cp);
            free_gen(cp, old_gen);
            // Every worker is past `next` now, so anything parked by an
            // earlier timed-out publication is reclaimable too.
            reclaim_retired(dp, cp);
            cp.counters().drain_stale(cp.mctx());
            drop(guard);
            Ok(())
        }
        Err(e) => {
            // Published, but not reclaimable yet: park the superseded
            // generation for a later publication to drain.
            (*old_gen).set_prev(cp.retired());
            cp.set_retired(old_gen);
            drop(guard);
            Err(e)
        }
    }
}

/// Step 7: every worker must have stored a generation number >= `target`.
unsafe fn wait_quiescence(
    dp: &DpConfig,
    target: u64,
    deadline: Option<Duration>,
) -> CpResult<()> {
    if dp.worker_count() == 0 {
        return Ok(());
    }
    let start = Instant::now();
    let mut spins = 0u64;
    loop {
        if dp.min_worker_gen() >= target {
            return Ok(());
        }
        if let Some(limit) = deadline {
            if start.elapsed() >= limit {
                dump_stuck_workers(dp, target);
                return Err(CpError::Stuck);
            }
        }
        spins += 1;
        if spins % 1024 == 0 {
            std::thread::yield_now();
        } else {
            spin_loop();
        }
    }
}

fn dump_stuck_workers(dp: &DpConfig, target: u64) {
    error!("quiescence wait for generation {target} timed out");
    for idx in 0..dp.worker_count() {
        if let Some(w) = dp.worker(idx) {
            if w.generation() < target {
                error!(
                    "  worker {idx}: generation {} of {target}, {} iterations, owner pid {}",
                    w.generation(),
                    w.iterations(),
                    w.owner_pid()
                );
            }
        }
    }
}

/// Drain the deferred-reclamation chain: a retired generation is freed once
/// the slowest worker has moved strictly past it.
pub(crate) unsafe fn reclaim_retired(dp: &DpConfig, cp: &CpConfig) {
    splice_quiesced(dp, cp);
    let min = dp.min_worker_gen();
    let mut pending: *mut ConfigGen = core::ptr::null_mut();
    let mut cur = cp.retired();
    cp.set_retired(core::ptr::null_mut());
    let mut freed = 0u64;
    while !cur.is_null() {
        let next = (*cur).prev_ptr();
        if min > (*cur).number() {
            splice_removed_list((*cur).take_removed());
            free_gen(cp, cur);
            freed += 1;
        } else {
            (*cur).set_prev(pending);
            pending = cur;
        }
        cur = next;
    }
    cp.set_retired(pending);
    if freed > 0 {
        info!("reclaimed {freed} deferred generations");
    }
}

/// Step 8: hand superseded and removed module data back to their owning
/// agents once no worker can reference them.
unsafe fn splice_quiesced(dp: &DpConfig, cp: &CpConfig) {
    let g = cp.current();
    if g.is_null() {
        return;
    }
    let min = dp.min_worker_gen();
    let reg = (*g).modules();
    if !reg.is_null() {
        for idx in 0..(*reg).count() {
            let m = (*reg).module(idx);
            if m.is_null() {
                continue;
            }
            if min >= (*m).generation() {
                let chain = (*m).prev_ptr();
                if !chain.is_null() {
                    (*m).set_prev(core::ptr::null_mut());
                    splice_module_chain(chain);
                }
            }
        }
    }
    if min >= (*g).number() {
        splice_removed_list((*g).take_removed());
    }
}

unsafe fn splice_module_chain(head: *mut ModuleData) {
    let mut cur = head;
    while !cur.is_null() {
        let next = (*cur).prev_ptr();
        (*cur).set_prev(core::ptr::null_mut());
        (*(*cur).agent_ptr()).push_free(cur);
        cur = next;
    }
}

unsafe fn splice_removed_list(head: *mut ModuleData) {
    let mut cur = head;
    while !cur.is_null() {
        let next = (*cur).link_ptr();
        let chain = (*cur).prev_ptr();
        (*cur).set_prev(core::ptr::null_mut());
        (*(*cur).agent_ptr()).push_free(cur);
        splice_module_chain(chain);
        cur = next;
    }
}

unsafe fn free_gen(cp: &CpConfig, g: *mut ConfigGen) {
    let m = (*g).modules();
    if !m.is_null() {
        ModuleRegistry::release(m, cp.mctx());
    }
    let p = (*g).pipelines();
    if !p.is_null() {
        PipelineRegistry::release(p, cp.mctx());
    }
    let d = (*g).devices();
    if !d.is_null() {
        DeviceRegistry::release(d, cp.mctx());
    }
    let s = (*g).counter_storage();
    if !s.is_null() {
        CounterStorage::release(cp.mctx(), s);
    }
    free_gen_node(cp, g);
}
