//! Shared fixtures: a one-zone dataplane over a temp-file segment, a small
//! set of packet modules, and packet helpers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use flowplane_controlplane::Agent;
use flowplane_dataplane::{
    DpInstance, DpOptions, ModuleDataView, ModuleDef, Packet, PacketFront, PacketList,
};
use flowplane_shm::cp::CpConfig;
use flowplane_shm::module::ModuleData;

static SEGMENT_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn segment_path(tag: &str) -> PathBuf {
    let seq = SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "flowplane-test-{}-{tag}-{seq}.shm",
        std::process::id()
    ))
}

/// Forwards everything unchanged.
pub fn passthrough(_: &ModuleDataView<'_>, front: &mut PacketFront) {
    loop {
        let p = front.input.pop();
        if p.is_null() {
            break;
        }
        unsafe { front.output(p) };
    }
}

/// Stamps `tx_device` with the u32 at the start of the module payload.
pub fn tag_from_payload(data: &ModuleDataView<'_>, front: &mut PacketFront) {
    let tag = unsafe { *data.payload_as::<u32>() };
    loop {
        let p = front.input.pop();
        if p.is_null() {
            break;
        }
        unsafe {
            (*p).tx_device = tag;
            front.output(p);
        }
    }
}

/// Releases everything.
pub fn dropper(_: &ModuleDataView<'_>, front: &mut PacketFront) {
    loop {
        let p = front.input.pop();
        if p.is_null() {
            break;
        }
        unsafe { front.drop_packet(p) };
    }
}

/// Odd hashes skip the rest of the pipeline; even hashes continue.
pub fn bypass_odd(_: &ModuleDataView<'_>, front: &mut PacketFront) {
    loop {
        let p = front.input.pop();
        if p.is_null() {
            break;
        }
        unsafe {
            if (*p).hash % 2 == 1 {
                front.bypass(p);
            } else {
                front.output(p);
            }
        }
    }
}

pub struct TestEnv {
    pub dp: DpInstance,
    pub path: PathBuf,
}

impl TestEnv {
    pub fn new(tag: &str, worker_count: u32) -> TestEnv {
        let path = segment_path(tag);
        let opts = DpOptions {
            storage_size: 8 << 20,
            zone_count: 1,
            numa_map: 0x1,
            dp_arena_size: 1 << 20,
            worker_count,
        };
        let dp = DpInstance::create(
            &path,
            &opts,
            &[
                ModuleDef {
                    name: "route",
                    handler: tag_from_payload,
                },
                ModuleDef {
                    name: "nat64",
                    handler: passthrough,
                },
                ModuleDef {
                    name: "filter",
                    handler: dropper,
                },
                ModuleDef {
                    name: "split",
                    handler: bypass_odd,
                },
            ],
        )
        .unwrap();
        TestEnv { dp, path }
    }

    pub fn agent(&self, name: &str) -> Agent {
        Agent::attach(self.dp.shm().clone(), 0, name, 1 << 20).unwrap()
    }

    pub fn cp(&self) -> &CpConfig {
        unsafe { &*(*self.dp.shm().dp_config(0).unwrap()).cp_config() }
    }

    /// Live (not yet freed) bytes of the zone controlplane context.
    pub fn cp_delta(&self) -> u64 {
        let m = self.cp().mctx();
        m.balloc_size() - m.bfree_size()
    }

    /// Run `f` while a background thread keeps worker slot 0 observing, so
    /// blocking publications can reach quiescence.
    pub fn with_observer<R>(&self, f: impl FnOnce() -> R) -> R {
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut w = self.dp.worker(0, 0).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    w.observe();
                    std::thread::yield_now();
                }
            });
            let r = f();
            stop.store(true, Ordering::Relaxed);
            r
        })
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Allocate a "route" record whose payload stamps `tag` onto packets.
pub fn route_module(agent: &Agent, name: &str, tag: u32) -> *mut ModuleData {
    let m = agent.alloc_module_data("route", name, 16, None).unwrap();
    unsafe { *((*m).payload() as *mut u32) = tag };
    m
}

pub fn push_packets(front: &mut PacketFront, hashes: &[u32]) {
    for &h in hashes {
        let p = Box::into_raw(Box::new(Packet::new(0, h)));
        unsafe { front.input.push(p) };
    }
}

/// Drain a list, returning the packet hashes and releasing the packets.
pub fn drain_hashes(list: &mut PacketList) -> Vec<u32> {
    let mut out = Vec::new();
    loop {
        let p = list.pop();
        if p.is_null() {
            break;
        }
        out.push(unsafe { (*p).hash });
        drop(unsafe { Box::from_raw(p) });
    }
    out
}

/// Drain a list, returning the stamped `tx_device` values.
pub fn drain_tags(list: &mut PacketList) -> Vec<u32> {
    let mut out = Vec::new();
    loop {
        let p = list.pop();
        if p.is_null() {
            break;
        }
        out.push(unsafe { (*p).tx_device });
        drop(unsafe { Box::from_raw(p) });
    }
    out
}
