use quantum_forge_netsim::node::RequestRecorder;
use quantum_forge_netsim::*;

/// Reservation protocol test suite
///
/// Hop-by-hop reservation over per-memory timecards: approval installs rules
/// on every hop, rejection unwinds every prior hop, and overlapping windows
/// are refused while disjoint windows share the same slots.

const PS_PER_SEC: u64 = 1_000_000_000_000;

fn three_router_topology() -> TopologyConfig {
    serde_json::from_str(
        r#"{
            "nodes": [
                {"name": "r1", "type": "QuantumRouter", "memo_size": 4},
                {"name": "m12", "type": "BSMNode"},
                {"name": "r2", "type": "QuantumRouter", "memo_size": 4},
                {"name": "m23", "type": "BSMNode"},
                {"name": "r3", "type": "QuantumRouter", "memo_size": 4}
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
    .expect("valid topology")
}

fn build() -> Simulation {
    let mut config = SimulatorConfig::default();
    config.hardware.memory.frequency = 2e6;
    let mut sim = Simulation::build(&three_router_topology(), config).expect("build");
    sim.install_app("r1", Box::new(RequestRecorder::new("r3", 0.0)))
        .expect("install");
    sim
}

fn recorder<'a>(sim: &'a Simulation) -> &'a RequestRecorder {
    sim.node("r1")
        .unwrap()
        .app
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<RequestRecorder>()
        .unwrap()
}

fn reserved_slots(sim: &Simulation, node: &str) -> usize {
    sim.node(node)
        .unwrap()
        .network_manager
        .timecards
        .iter()
        .filter(|card| !card.reservations.is_empty())
        .count()
}

#[test]
fn test_oversized_request_unwinds_all_hops() {
    // Scenario: the intermediate hop needs 2x the requested size; 3 slots
    // demand 6 of r2's 4 memories, so the reservation must bounce and leave
    // no hop holding it.
    let mut sim = build();
    sim.request("r1", "r3", PS_PER_SEC, 10 * PS_PER_SEC, 3, 0.9)
        .expect("request");
    sim.init().expect("init");
    sim.timeline.set_stop_time(100_000_000);
    sim.run().expect("run");

    assert_eq!(recorder(&sim).rejected.len(), 1);
    assert!(recorder(&sim).approved.is_empty());
    for node in ["r1", "r2", "r3"] {
        assert_eq!(reserved_slots(&sim, node), 0, "{node} still holds slots");
    }

    // A request within the limit succeeds afterwards on the same window
    sim.request("r1", "r3", PS_PER_SEC, 10 * PS_PER_SEC, 2, 0.9)
        .expect("request");
    sim.timeline.set_stop_time(200_000_000);
    sim.run().expect("run");

    assert_eq!(recorder(&sim).approved.len(), 1);
    assert_eq!(reserved_slots(&sim, "r1"), 2);
    assert_eq!(reserved_slots(&sim, "r2"), 4);
    assert_eq!(reserved_slots(&sim, "r3"), 2);
}

#[test]
fn test_overlapping_windows_are_refused() {
    let mut sim = build();
    sim.request("r1", "r3", PS_PER_SEC, 10 * PS_PER_SEC, 2, 0.9)
        .expect("request");
    sim.init().expect("init");
    sim.timeline.set_stop_time(100_000_000);
    sim.run().expect("run");
    assert_eq!(recorder(&sim).approved.len(), 1);

    // The second window overlaps and r2 has no free slots left
    sim.request("r1", "r3", 5 * PS_PER_SEC, 15 * PS_PER_SEC, 2, 0.9)
        .expect("request");
    sim.timeline.set_stop_time(200_000_000);
    sim.run().expect("run");
    assert_eq!(recorder(&sim).rejected.len(), 1);

    // A disjoint window books the same physical slots
    sim.request("r1", "r3", 20 * PS_PER_SEC, 30 * PS_PER_SEC, 2, 0.9)
        .expect("request");
    sim.timeline.set_stop_time(300_000_000);
    sim.run().expect("run");
    assert_eq!(recorder(&sim).approved.len(), 2);
    let r2 = sim.node("r2").unwrap();
    let double_booked = r2
        .network_manager
        .timecards
        .iter()
        .filter(|card| card.reservations.len() == 2)
        .count();
    assert_eq!(double_booked, 4, "disjoint windows share the slots");
}

#[test]
fn test_approval_installs_rules_on_every_hop() {
    let mut sim = build();
    sim.request("r1", "r3", 1_000_000_000, 10 * PS_PER_SEC, 1, 0.9)
        .expect("request");
    sim.init().expect("init");
    // Run past the window start so staged rules are live
    sim.timeline.set_stop_time(1_500_000_000);
    sim.run().expect("run");

    let r1_rules = sim.node("r1").unwrap().resource_manager.rules();
    let r2_rules = sim.node("r2").unwrap().resource_manager.rules();
    let r3_rules = sim.node("r3").unwrap().resource_manager.rules();
    // Ends: generation + purification + swap endpoint
    assert_eq!(r1_rules.len(), 3);
    assert_eq!(r3_rules.len(), 3);
    // Intermediate: generation both ways + purification + swap middle
    assert_eq!(r2_rules.len(), 4);
    // Rules scan lowest priority first
    for rules in [r1_rules, r2_rules, r3_rules] {
        for pair in rules.windows(2) {
            assert!(pair[0].priority <= pair[1].priority);
        }
    }
}

#[test]
fn test_expired_window_clears_rules_and_cards() {
    let mut sim = build();
    sim.request("r1", "r3", 1_000_000_000, 2_000_000_000, 1, 0.9)
        .expect("request");
    sim.init().expect("init");
    sim.timeline.set_stop_time(3_000_000_000);
    sim.run().expect("run");

    for node in ["r1", "r2", "r3"] {
        assert!(
            sim.node(node).unwrap().resource_manager.rules().is_empty(),
            "{node} kept rules past the window"
        );
        assert_eq!(reserved_slots(&sim, node), 0, "{node} kept timecards");
    }
}
