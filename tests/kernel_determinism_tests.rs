use quantum_forge_netsim::*;

/// Kernel determinism test suite
///
/// Validates the scheduling contract end-to-end: identical seeds and
/// topologies must produce identical observable states, dispatch must be
/// monotone in time, and routing tables must be stable across builds.

fn line_topology(raw_fidelity: f64) -> (TopologyConfig, SimulatorConfig) {
    let topo: TopologyConfig = serde_json::from_str(
        r#"{
            "nodes": [
                {"name": "r1", "type": "QuantumRouter", "memo_size": 4},
                {"name": "m1", "type": "BSMNode"},
                {"name": "r2", "type": "QuantumRouter", "memo_size": 4}
            ],
            "qconnections": [
                {"node1": "r1", "node2": "m1", "attenuation": 0.0, "distance": 500.0},
                {"node1": "r2", "node2": "m1", "attenuation": 0.0, "distance": 500.0}
            ],
            "cconnections": []
        }"#,
    )
    .expect("valid topology");
    let mut config = SimulatorConfig::default();
    config.hardware.memory.raw_fidelity = raw_fidelity;
    config.hardware.memory.frequency = 2e6;
    (topo, config)
}

fn run_generation(seed: u64) -> (Vec<(String, Vec<resource_manager::MemoryInfo>)>, u64, u64) {
    let (topo, mut config) = line_topology(0.9);
    config.seed = seed;
    let mut sim = Simulation::build(&topo, config).expect("build");
    sim.install_app("r1", Box::new(RequestRecorder::new("r2", 0.5)))
        .expect("install app");
    sim.request("r1", "r2", 1_000_000_000_000, 2_000_000_000_000, 2, 0.9)
        .expect("request");
    sim.init().expect("init");
    sim.timeline.set_stop_time(1_100_000_000_000);
    sim.run().expect("run");
    (
        sim.memory_snapshot(),
        sim.now(),
        sim.timeline.executed_events(),
    )
}

#[test]
fn test_same_seed_runs_are_identical() {
    let (snap_a, now_a, events_a) = run_generation(42);
    let (snap_b, now_b, events_b) = run_generation(42);
    assert_eq!(now_a, now_b);
    assert_eq!(events_a, events_b);
    assert_eq!(snap_a, snap_b);
}

#[test]
fn test_different_seeds_still_complete() {
    // Determinism must not depend on a particular lucky seed
    for seed in [0, 1, 7, 1234] {
        let (snapshot, _, events) = run_generation(seed);
        assert!(events > 0, "seed {seed} executed no events");
        assert_eq!(snapshot.len(), 3);
    }
}

#[test]
fn test_dispatch_times_are_monotone() {
    // A run's final time never exceeds the stop time, and repeated shorter
    // runs advance the clock monotonically
    let (topo, config) = line_topology(0.9);
    let mut sim = Simulation::build(&topo, config).expect("build");
    sim.request("r1", "r2", 1_000_000_000_000, 2_000_000_000_000, 1, 0.9)
        .expect("request");
    sim.init().expect("init");
    let mut last_now = 0;
    for stop in [
        5_000_000u64,
        50_000_000,
        1_000_500_000_000,
        1_100_000_000_000,
    ] {
        sim.timeline.set_stop_time(stop);
        sim.run().expect("run");
        assert!(sim.now() >= last_now, "clock moved backwards");
        assert!(sim.now() < stop, "dispatched at or past the stop time");
        last_now = sim.now();
    }
}

#[test]
fn test_entity_rngs_are_construction_order_independent() {
    // Reversing node declaration order must not change per-entity streams:
    // generators derive from (seed, entity name), not from creation order
    let (topo, config) = line_topology(0.9);
    let mut reversed = topo.clone();
    reversed.nodes.reverse();
    let run = |topology: &TopologyConfig| {
        let mut sim = Simulation::build(topology, config.clone()).expect("build");
        sim.request("r1", "r2", 1_000_000_000_000, 2_000_000_000_000, 2, 0.9)
            .expect("request");
        sim.init().expect("init");
        sim.timeline.set_stop_time(1_100_000_000_000);
        sim.run().expect("run");
        sim.memory_snapshot()
    };
    assert_eq!(run(&topo), run(&reversed));
}

#[test]
fn test_distance_vector_routing_converges() {
    let topo: TopologyConfig = serde_json::from_str(
        r#"{
            "nodes": [
                {"name": "r1", "type": "QuantumRouter", "memo_size": 2},
                {"name": "m12", "type": "BSMNode"},
                {"name": "r2", "type": "QuantumRouter", "memo_size": 2},
                {"name": "m23", "type": "BSMNode"},
                {"name": "r3", "type": "QuantumRouter", "memo_size": 2}
            ],
            "qconnections": [
                {"node1": "r1", "node2": "m12", "attenuation": 0.0, "distance": 500.0},
                {"node1": "r2", "node2": "m12", "attenuation": 0.0, "distance": 500.0},
                {"node1": "r2", "node2": "m23", "attenuation": 0.0, "distance": 500.0},
                {"node1": "r3", "node2": "m23", "attenuation": 0.0, "distance": 500.0}
            ],
            "cconnections": []
        }"#,
    )
    .expect("valid topology");
    let config = SimulatorConfig {
        distance_vector_routing: true,
        ..SimulatorConfig::default()
    };
    let mut sim = Simulation::build(&topo, config).expect("build");
    sim.init().expect("init");
    sim.run().expect("run");
    let r1 = sim.node("r1").expect("r1");
    assert_eq!(r1.network_manager.forwarding["r2"], "r2");
    assert_eq!(r1.network_manager.forwarding["r3"], "r2");
    let r3 = sim.node("r3").expect("r3");
    assert_eq!(r3.network_manager.forwarding["r1"], "r2");
}

#[test]
fn test_static_and_dynamic_routing_agree() {
    let (topo, config) = line_topology(0.9);
    let static_sim = Simulation::build(&topo, config.clone()).expect("build");
    let dynamic_config = SimulatorConfig {
        distance_vector_routing: true,
        ..config
    };
    let mut dynamic_sim = Simulation::build(&topo, dynamic_config).expect("build");
    dynamic_sim.init().expect("init");
    dynamic_sim.run().expect("run");
    for name in ["r1", "r2"] {
        let static_table = &static_sim.node(name).unwrap().network_manager.forwarding;
        let dynamic_table = &dynamic_sim.node(name).unwrap().network_manager.forwarding;
        for (dst, hop) in static_table {
            assert_eq!(dynamic_table.get(dst), Some(hop), "{name} -> {dst}");
        }
    }
}
