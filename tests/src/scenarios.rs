use flowplane_controlplane::{
    CpError, DeviceConfig, PipelineConfig, counter_values, devices_info, modules_info,
    pipelines_info,
};
use flowplane_counters::COUNTER_GC_GENERATIONS;
use flowplane_dataplane::PacketFront;
use flowplane_shm::SharedMemory;

use crate::common::*;

#[test]
fn register_counter_in_fresh_zone() {
    let env = TestEnv::new("counter", 0);
    let agent = env.agent("a");

    let id = agent.register_counter("pkts", 1).unwrap();
    assert_eq!(id, 0);
    assert_eq!(env.cp().counters().entry(0).unwrap().pool(), 0);

    // Offsets are linked at publication; the counter resolves afterwards.
    agent.update_modules(&[]).unwrap();
    let values = counter_values(env.dp.shm(), 0, "pkts", 1).unwrap();
    assert_eq!(values, Some(vec![0]));

    agent.detach().unwrap();
}

#[test]
fn counter_accumulates_across_instances() {
    let env = TestEnv::new("accum", 4);
    let agent = env.agent("a");
    agent.register_counter("pkts", 1).unwrap();
    agent.update_modules(&[]).unwrap();

    let worker = env.dp.worker(0, 0).unwrap();
    let handle = worker.counter("pkts", 1).unwrap();
    unsafe {
        handle.add(0, 0, 10);
        handle.add(1, 0, 20);
        handle.add(2, 0, 30);
        handle.add(3, 0, 40);
    }
    let mut accum = [0u64];
    unsafe { handle.accumulate(&mut accum, 4) };
    assert_eq!(accum[0], 100);

    let values = counter_values(env.dp.shm(), 0, "pkts", 1).unwrap();
    assert_eq!(values, Some(vec![100]));
}

#[test]
fn stale_counters_are_garbage_collected() {
    let env = TestEnv::new("countergc", 0);
    let agent = env.agent("a");
    agent.register_counter("oneshot", 1).unwrap();
    agent.update_modules(&[]).unwrap();
    assert!(
        counter_values(env.dp.shm(), 0, "oneshot", 1)
            .unwrap()
            .is_some()
    );

    // "refreshed" is re-registered before every publication and rides the
    // whole window; "oneshot" is never refreshed and falls out of it, so
    // a publication expires it and compacts the registry.
    for _ in 0..=COUNTER_GC_GENERATIONS {
        agent.register_counter("refreshed", 2).unwrap();
        agent.update_modules(&[]).unwrap();
    }
    assert!(
        counter_values(env.dp.shm(), 0, "oneshot", 1)
            .unwrap()
            .is_none()
    );
    assert!(
        counter_values(env.dp.shm(), 0, "refreshed", 2)
            .unwrap()
            .is_some()
    );
    agent.detach().unwrap();
}

#[test]
fn publish_modules_bumps_generation() {
    let env = TestEnv::new("modules", 0);
    let agent = env.agent("a");

    let r0 = route_module(&agent, "r0", 1);
    let n0 = agent.alloc_module_data("nat64", "n0", 16, None).unwrap();
    agent.update_modules(&[r0, n0]).unwrap();

    assert_eq!(env.cp().gen_counter(), 1);
    let mods = modules_info(env.dp.shm(), 0).unwrap();
    assert_eq!(mods.len(), 2);
    assert_eq!(mods[0].name, "r0");
    assert_eq!(mods[0].generation, 1);
    assert_eq!(mods[1].name, "n0");
    assert_eq!(mods[0].agent, "a");
}

#[test]
fn publish_pipeline_resolves_modules() {
    let env = TestEnv::new("pipeline", 0);
    let agent = env.agent("a");

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

    let pipelines = pipelines_info(env.dp.shm(), 0).unwrap();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0].modules, vec![0, 1]);
    let mods = modules_info(env.dp.shm(), 0).unwrap();
    assert_eq!(mods[0].name, "r0");
    assert_eq!(mods[1].name, "n0");
}

#[test]
fn republish_replaces_slot_and_reclaims() {
    let env = TestEnv::new("republish", 0);
    let agent = env.agent("a");

    let r0 = route_module(&agent, "r0", 1);
    let n0 = agent.alloc_module_data("nat64", "n0", 16, None).unwrap();
    agent.update_modules(&[r0, n0]).unwrap();

    let r0_new = route_module(&agent, "r0", 2);
    agent.update_modules(&[r0_new]).unwrap();

    let mods = modules_info(env.dp.shm(), 0).unwrap();
    assert_eq!(mods.len(), 2, "replacement must not change the count");
    assert_eq!(mods[0].name, "r0");
    assert_eq!(mods[0].generation, 2);
    assert_eq!(agent.loaded_module_count(), 2);

    // The superseded record came back on the agent free list; exactly the
    // two live records remain charged to the agent arena.
    assert_eq!(agent.collect(), 1);
    let record = flowplane_mem::block_size_for(
        flowplane_shm::module::ModuleData::payload_offset() + 16,
    )
    .unwrap();
    assert_eq!(agent.allocated() - agent.freed(), 2 * record);

    agent.detach().unwrap();
}

#[test]
fn failed_update_leaves_state_untouched() {
    let env = TestEnv::new("atomic", 0);
    let agent = env.agent("a");

    let r0 = route_module(&agent, "r0", 1);
    agent.update_modules(&[r0]).unwrap();
    agent
        .update_pipelines(&[PipelineConfig {
            modules: vec![("route".into(), "r0".into())],
        }])
        .unwrap();
    let gen_before = env.cp().gen_counter();
    let delta_before = env.cp_delta();

    // Unknown module type.
    let err = agent
        .update_pipelines(&[PipelineConfig {
            modules: vec![("bogus".into(), "x".into())],
        }])
        .unwrap_err();
    assert_eq!(err, CpError::NotFound);

    // Known type, unknown instance.
    let err = agent
        .update_pipelines(&[PipelineConfig {
            modules: vec![("route".into(), "missing".into())],
        }])
        .unwrap_err();
    assert_eq!(err, CpError::NotFound);

    // Device referencing an unknown pipeline.
    let err = agent
        .update_devices(&[DeviceConfig {
            device_id: 0,
            pipelines: vec![(7, 1)],
        }])
        .unwrap_err();
    assert_eq!(err, CpError::NotFound);

    assert_eq!(env.cp().gen_counter(), gen_before);
    assert_eq!(env.cp_delta(), delta_before, "no allocations may linger");
    assert_eq!(pipelines_info(env.dp.shm(), 0).unwrap().len(), 1);
}

#[test]
fn weighted_dispatch_splits_by_hash() {
    let env = TestEnv::new("dispatch", 1);
    let agent = env.agent("a");

    let r0 = route_module(&agent, "r0", 7);
    let f0 = agent.alloc_module_data("filter", "f0", 16, None).unwrap();
    agent.update_modules(&[r0, f0]).unwrap();
    env.with_observer(|| {
        agent
            .update_pipelines(&[
                PipelineConfig {
                    modules: vec![("route".into(), "r0".into())],
                },
                PipelineConfig {
                    modules: vec![("filter".into(), "f0".into())],
                },
            ])
            .unwrap();
        agent
            .update_devices(&[DeviceConfig {
                device_id: 0,
                pipelines: vec![(0, 1), (1, 1)],
            }])
            .unwrap();
    });

    let mut worker = env.dp.worker(0, 0).unwrap();
    let mut front = PacketFront::new();
    push_packets(&mut front, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    worker.process(0, &mut front);

    // Even hashes hit the route pipeline and come out tagged; odd hashes
    // hit the filter pipeline and are dropped.
    let tags = drain_tags(&mut front.output);
    assert_eq!(tags.len(), 5);
    assert!(tags.iter().all(|&t| t == 7));
    let dropped = drain_hashes(&mut front.drops);
    assert_eq!(dropped.len(), 5);
    assert!(dropped.iter().all(|&h| h % 2 == 1));
    assert_eq!(worker.observed_gen(), env.cp().gen_counter());
}

#[test]
fn bypass_skips_remaining_modules() {
    let env = TestEnv::new("bypass", 1);
    let agent = env.agent("a");

    let s0 = agent.alloc_module_data("split", "s0", 16, None).unwrap();
    let f0 = agent.alloc_module_data("filter", "f0", 16, None).unwrap();
    agent.update_modules(&[s0, f0]).unwrap();
    env.with_observer(|| {
        agent
            .update_pipelines(&[PipelineConfig {
                modules: vec![
                    ("split".into(), "s0".into()),
                    ("filter".into(), "f0".into()),
                ],
            }])
            .unwrap();
        agent
            .update_devices(&[DeviceConfig {
                device_id: 0,
                pipelines: vec![(0, 1)],
            }])
            .unwrap();
    });

    let mut worker = env.dp.worker(0, 0).unwrap();
    let mut front = PacketFront::new();
    push_packets(&mut front, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    worker.process(0, &mut front);

    // Odd hashes bypassed the filter and survived; even hashes reached the
    // filter and were dropped.
    let survived = drain_hashes(&mut front.output);
    assert_eq!(survived.len(), 5);
    assert!(survived.iter().all(|&h| h % 2 == 1));
    assert_eq!(drain_hashes(&mut front.drops).len(), 5);
}

#[test]
fn unknown_device_drops_everything() {
    let env = TestEnv::new("nodev", 1);
    let agent = env.agent("a");
    let r0 = route_module(&agent, "r0", 1);
    agent.update_modules(&[r0]).unwrap();
    env.with_observer(|| {
        agent
            .update_pipelines(&[PipelineConfig {
                modules: vec![("route".into(), "r0".into())],
            }])
            .unwrap();
    });

    let mut worker = env.dp.worker(0, 0).unwrap();
    let mut front = PacketFront::new();
    push_packets(&mut front, &[1, 2, 3]);
    worker.process(9, &mut front);
    assert!(front.output.is_empty());
    assert_eq!(drain_hashes(&mut front.drops).len(), 3);
}

#[test]
fn device_update_merges_by_id() {
    let env = TestEnv::new("devmerge", 0);
    let agent = env.agent("a");
    let r0 = route_module(&agent, "r0", 1);
    agent.update_modules(&[r0]).unwrap();
    agent
        .update_pipelines(&[
            PipelineConfig {
                modules: vec![("route".into(), "r0".into())],
            },
            PipelineConfig {
                modules: vec![("route".into(), "r0".into())],
            },
        ])
        .unwrap();

    agent
        .update_devices(&[DeviceConfig {
            device_id: 0,
            pipelines: vec![(0, 3)],
        }])
        .unwrap();
    agent
        .update_devices(&[DeviceConfig {
            device_id: 2,
            pipelines: vec![(1, 5)],
        }])
        .unwrap();

    let devices = devices_info(env.dp.shm(), 0).unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].device_id, 0);
    assert_eq!(devices[0].pipelines, vec![(0, 3)]);
    assert_eq!(devices[1].device_id, 2);
    assert_eq!(devices[1].pipelines, vec![(1, 5)]);
}

#[test]
fn second_mapping_sees_the_same_configuration() {
    let env = TestEnv::new("remap", 0);
    let agent = env.agent("a");
    let r0 = route_module(&agent, "r0", 1);
    agent.update_modules(&[r0]).unwrap();

    // A second mapping of the same file lands at a different base address;
    // every link must still resolve.
    let other = SharedMemory::attach(&env.path).unwrap();
    assert_eq!(other.numa_map(), 0x1);
    let mods = modules_info(&other, 0).unwrap();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0].name, "r0");
    assert_eq!(mods[0].agent, "a");
}
