//! Read-only introspection of a zone's current configuration.
//!
//! Each getter snapshots the current generation into caller-owned vectors
//! under a brief hold of the zone lock; nothing here keeps references into
//! the segment.

use flowplane_counters::CounterHandle;
use flowplane_shm::segment::SharedMemory;

use crate::error::CpResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Dataplane module kind index.
    pub index: u32,
    pub name: String,
    /// Generation in which this record became current.
    pub generation: u64,
    pub agent: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineInfo {
    /// Positions into the module registry, in execution order.
    pub modules: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u32,
    /// `(pipeline index, weight)` pairs, as stored.
    pub pipelines: Vec<(u64, u64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub pid: u32,
    pub memory_limit: u64,
    pub allocated: u64,
    pub freed: u64,
    pub loaded_module_count: u64,
}

pub fn modules_info(shm: &SharedMemory, numa_idx: u32) -> CpResult<Vec<ModuleInfo>> {
    let dp = shm.dp_config(numa_idx)?;
    unsafe {
        let cp = &*(*dp).cp_config();
        let _guard = cp.lock().lock();
        let current = cp.current();
        if current.is_null() {
            return Ok(Vec::new());
        }
        let reg = (*current).modules();
        if reg.is_null() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity((*reg).count() as usize);
        for idx in 0..(*reg).count() {
            let m = (*reg).module(idx);
            if m.is_null() {
                continue;
            }
            let agent = (*m).agent_ptr();
            out.push(ModuleInfo {
                index: (*m).index(),
                name: (*m).name().to_string(),
                generation: (*m).generation(),
                agent: (*agent).name().to_string(),
            });
        }
        Ok(out)
    }
}

pub fn pipelines_info(shm: &SharedMemory, numa_idx: u32) -> CpResult<Vec<PipelineInfo>> {
    let dp = shm.dp_config(numa_idx)?;
    unsafe {
        let cp = &*(*dp).cp_config();
        let _guard = cp.lock().lock();
        let current = cp.current();
        if current.is_null() {
            return Ok(Vec::new());
        }
        let reg = (*current).pipelines();
        if reg.is_null() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity((*reg).count() as usize);
        for idx in 0..(*reg).count() {
            let p = (*reg).pipeline(idx);
            out.push(PipelineInfo {
                modules: (*p).modules().to_vec(),
            });
        }
        Ok(out)
    }
}

pub fn devices_info(shm: &SharedMemory, numa_idx: u32) -> CpResult<Vec<DeviceInfo>> {
    let dp = shm.dp_config(numa_idx)?;
    unsafe {
        let cp = &*(*dp).cp_config();
        let _guard = cp.lock().lock();
        let current = cp.current();
        if current.is_null() {
            return Ok(Vec::new());
        }
        let reg = (*current).devices();
        if reg.is_null() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for id in 0..(*reg).count() {
            let d = (*reg).slot(id).load();
            if d.is_null() {
                continue;
            }
            out.push(DeviceInfo {
                device_id: id as u32,
                pipelines: (*d).refs().iter().map(|r| (r.pipeline, r.weight)).collect(),
            });
        }
        Ok(out)
    }
}

pub fn agents_info(shm: &SharedMemory, numa_idx: u32) -> CpResult<Vec<AgentInfo>> {
    let dp = shm.dp_config(numa_idx)?;
    unsafe {
        let cp = &*(*dp).cp_config();
        let _guard = cp.lock().lock();
        let mut out = Vec::with_capacity(cp.agent_count() as usize);
        let mut cur = cp.agents_head();
        while !cur.is_null() {
            let a = &*cur;
            out.push(AgentInfo {
                name: a.name().to_string(),
                pid: a.pid(),
                memory_limit: a.memory_limit(),
                allocated: a.mctx().balloc_size(),
                freed: a.mctx().bfree_size(),
                loaded_module_count: a.loaded_module_count(),
            });
            cur = a.next_ptr();
        }
        Ok(out)
    }
}

/// Aggregate a counter's value across every instance of the current
/// generation's storage. Returns `None` when the counter is unknown or not
/// linked yet.
pub fn counter_values(
    shm: &SharedMemory,
    numa_idx: u32,
    name: &str,
    size: u64,
) -> CpResult<Option<Vec<u64>>> {
    let dp = shm.dp_config(numa_idx)?;
    unsafe {
        let cp = &*(*dp).cp_config();
        let _guard = cp.lock().lock();
        let current = cp.current();
        if current.is_null() {
            return Ok(None);
        }
        let storage = (*current).counter_storage();
        if storage.is_null() {
            return Ok(None);
        }
        let Some(id) = cp.counters().lookup(name, size) else {
            return Ok(None);
        };
        let Some(handle) = CounterHandle::resolve(storage, cp.counters(), id) else {
            return Ok(None);
        };
        let mut accum = vec![0u64; size as usize];
        handle.accumulate(&mut accum, (*storage).instance_count());
        Ok(Some(accum))
    }
}
