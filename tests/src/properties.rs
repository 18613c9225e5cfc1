use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flowplane_controlplane::{
    Agent, CpError, DeviceConfig, PipelineConfig, PublishOptions, agents_info, devices_info,
    modules_info, pipelines_info,
};

use crate::common::*;

#[test]
fn generation_numbers_are_strictly_monotonic() {
    let env = TestEnv::new("monotonic", 0);
    let agent = env.agent("a");
    assert_eq!(env.cp().gen_counter(), 0);

    let r0 = route_module(&agent, "r0", 1);
    agent.update_modules(&[r0]).unwrap();
    assert_eq!(env.cp().gen_counter(), 1);

    agent
        .update_pipelines(&[PipelineConfig {
            modules: vec![("route".into(), "r0".into())],
        }])
        .unwrap();
    assert_eq!(env.cp().gen_counter(), 2);

    agent
        .update_devices(&[DeviceConfig {
            device_id: 0,
            pipelines: vec![(0, 1)],
        }])
        .unwrap();
    assert_eq!(env.cp().gen_counter(), 3);

    // A failed update must not advance the counter.
    let err = agent
        .update_pipelines(&[PipelineConfig {
            modules: vec![("route".into(), "gone".into())],
        }])
        .unwrap_err();
    assert_eq!(err, CpError::NotFound);
    assert_eq!(env.cp().gen_counter(), 3);
}

#[test]
fn attach_detach_cycles_do_not_leak() {
    let env = TestEnv::new("leak", 0);

    // Plain attach/detach returns every byte.
    let base = env.cp_delta();
    for _ in 0..3 {
        let agent = env.agent("cycle");
        agent.detach().unwrap();
    }
    assert_eq!(env.cp_delta(), base);

    // Full publish cycles settle into a steady state: each additional
    // cycle nets zero live bytes.
    let cycle = |name: &str| {
        let agent = env.agent(name);
        let r0 = route_module(&agent, "r0", 1);
        let n0 = agent.alloc_module_data("nat64", "n0", 16, None).unwrap();
        agent.update_modules(&[r0, n0]).unwrap();
        agent
            .update_pipelines(&[PipelineConfig {
                modules: vec![
                    ("route".into(), "r0".into()),
                    ("nat64".into(), "n0".into()),
                ],
            }])
            .unwrap();
        agent
            .update_devices(&[DeviceConfig {
                device_id: 0,
                pipelines: vec![(0, 1)],
            }])
            .unwrap();
        let r0_new = route_module(&agent, "r0", 2);
        agent.update_modules(&[r0_new]).unwrap();
        agent.collect();
        agent.detach().unwrap();
    };
    cycle("a1");
    let after_first = env.cp_delta();
    cycle("a2");
    assert_eq!(env.cp_delta(), after_first);
    cycle("a3");
    assert_eq!(env.cp_delta(), after_first);
}

#[test]
fn publisher_blocks_until_workers_observe() {
    let env = TestEnv::new("quiesce", 1);
    let agent = env.agent("a");
    let first = route_module(&agent, "r0", 1);
    agent.update_modules(&[first]).unwrap();

    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut worker = env.dp.worker(0, 0).unwrap();
            while !stop.load(Ordering::Relaxed) {
                worker.observe();
                std::thread::yield_now();
            }
        });
        // Each update blocks on quiescence before reclaiming; the running
        // worker lets all of them through.
        for tag in 2..=5 {
            let m = route_module(&agent, "r0", tag);
            agent.update_modules(&[m]).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(env.cp().gen_counter(), 5);
    // Four republications, each superseding one record, all reclaimed.
    assert_eq!(agent.collect(), 4);
    assert!(env.cp().retired().is_null());
}

#[test]
fn quiescence_deadline_defers_reclamation() {
    let env = TestEnv::new("stuck", 1);
    let mut agent = env.agent("a");
    let m1 = route_module(&agent, "r0", 1);
    agent.update_modules(&[m1]).unwrap();

    // Nobody drives the worker: the second publication times out. It is
    // still published; only reclamation is deferred.
    agent.set_publish_options(PublishOptions {
        quiescence_deadline: Some(Duration::from_millis(50)),
    });
    let m2 = route_module(&agent, "r0", 2);
    assert_eq!(agent.update_modules(&[m2]).unwrap_err(), CpError::Stuck);
    assert_eq!(env.cp().gen_counter(), 2);
    let mods = modules_info(env.dp.shm(), 0).unwrap();
    assert_eq!(mods[0].generation, 2);
    assert!(!env.cp().retired().is_null());
    assert_eq!(agent.collect(), 0, "nothing may be reclaimed early");

    // Once the worker catches up, the next blocking publication drains the
    // deferred generation and both superseded records come back.
    agent.set_publish_options(PublishOptions::default());
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut worker = env.dp.worker(0, 0).unwrap();
            while !stop.load(Ordering::Relaxed) {
                worker.observe();
                std::thread::yield_now();
            }
        });
        let m3 = route_module(&agent, "r0", 3);
        agent.update_modules(&[m3]).unwrap();
        stop.store(true, Ordering::Relaxed);
    });

    assert!(env.cp().retired().is_null());
    assert_eq!(agent.collect(), 2);
}

#[test]
fn detach_removes_modules_pipelines_and_device_refs() {
    let env = TestEnv::new("detach", 0);
    let keeper = env.agent("keeper");
    let leaver = env.agent("leaver");

    let k0 = keeper.alloc_module_data("nat64", "k0", 16, None).unwrap();
    keeper.update_modules(&[k0]).unwrap();
    let r0 = route_module(&leaver, "r0", 1);
    leaver.update_modules(&[r0]).unwrap();

    // Pipeline 0 uses only the keeper's module, pipeline 1 the leaver's.
    leaver
        .update_pipelines(&[
            PipelineConfig {
                modules: vec![("nat64".into(), "k0".into())],
            },
            PipelineConfig {
                modules: vec![("route".into(), "r0".into())],
            },
        ])
        .unwrap();
    leaver
        .update_devices(&[
            DeviceConfig {
                device_id: 0,
                pipelines: vec![(0, 1)],
            },
            DeviceConfig {
                device_id: 1,
                pipelines: vec![(0, 1), (1, 1)],
            },
        ])
        .unwrap();

    leaver.detach().unwrap();

    // The leaver's module and pipeline are gone; the keeper's pipeline
    // survived with its position remapped, and device 1 lost only the
    // reference into the dropped pipeline.
    let mods = modules_info(env.dp.shm(), 0).unwrap();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0].name, "k0");
    let pipelines = pipelines_info(env.dp.shm(), 0).unwrap();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].modules, vec![0]);
    let devices = devices_info(env.dp.shm(), 0).unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].pipelines, vec![(0, 1)]);
    assert_eq!(devices[1].pipelines, vec![(0, 1)]);

    let agents = agents_info(env.dp.shm(), 0).unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, "keeper");
    keeper.detach().unwrap();
}

#[test]
fn attach_validates_arguments_and_duplicates() {
    let env = TestEnv::new("attach", 0);

    let err = Agent::attach(env.dp.shm().clone(), 0, "", 1 << 20).unwrap_err();
    assert_eq!(err, CpError::InvalidArgument);
    let err = Agent::attach(env.dp.shm().clone(), 0, "a", 0).unwrap_err();
    assert_eq!(err, CpError::InvalidArgument);
    let err = Agent::attach(env.dp.shm().clone(), 7, "a", 1 << 20).unwrap_err();
    assert_eq!(err, CpError::NotFound);

    let first = env.agent("dup");
    let err = Agent::attach(env.dp.shm().clone(), 0, "dup", 1 << 20).unwrap_err();
    assert_eq!(err, CpError::Exists);
    first.detach().unwrap();

    // After detach the name is free again.
    let again = env.agent("dup");
    again.detach().unwrap();
}

#[test]
fn agent_arena_budget_is_enforced() {
    let env = TestEnv::new("budget", 0);
    let agent = Agent::attach(env.dp.shm().clone(), 0, "small", 64 << 10).unwrap();

    // A record larger than the whole sub-arena cannot be allocated.
    let err = agent
        .alloc_module_data("route", "big", 128 << 10, None)
        .unwrap_err();
    assert_eq!(err, CpError::OutOfMemory);

    // Small records fit until the budget runs out, and the failure leaves
    // the arena usable.
    let m = agent.alloc_module_data("route", "ok", 1 << 10, None).unwrap();
    unsafe { agent.free_module_data(m) };
    assert_eq!(agent.allocated(), agent.freed());
    agent.detach().unwrap();
}

#[test]
fn unknown_module_kind_is_rejected_at_allocation() {
    let env = TestEnv::new("badkind", 0);
    let agent = env.agent("a");
    let err = agent
        .alloc_module_data("no-such-kind", "x", 16, None)
        .unwrap_err();
    assert_eq!(err, CpError::NotFound);
    agent.detach().unwrap();
}

#[test]
fn free_handlers_run_in_owning_process() {
    use std::sync::atomic::AtomicU32;
    static FREED: AtomicU32 = AtomicU32::new(0);

    unsafe fn count_free(_: *mut flowplane_shm::module::ModuleData) {
        FREED.fetch_add(1, Ordering::Relaxed);
    }

    let env = TestEnv::new("freehandler", 0);
    let agent = env.agent("a");
    let m1 = agent
        .alloc_module_data("route", "r0", 16, Some(count_free))
        .unwrap();
    agent.update_modules(&[m1]).unwrap();
    let m2 = agent
        .alloc_module_data("route", "r0", 16, Some(count_free))
        .unwrap();
    agent.update_modules(&[m2]).unwrap();

    assert_eq!(FREED.load(Ordering::Relaxed), 0);
    assert_eq!(agent.collect(), 1);
    assert_eq!(FREED.load(Ordering::Relaxed), 1);
    agent.detach().unwrap();
    assert_eq!(FREED.load(Ordering::Relaxed), 2);
}
