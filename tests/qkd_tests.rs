use quantum_forge_netsim::*;

/// QKD stack test suite
///
/// BB84 sifting over a polarization-noisy channel with cascade error
/// correction on top: both sides must end up holding identical keys.

fn qkd_topology(polarization_fidelity: f64) -> TopologyConfig {
    let json = format!(
        r#"{{
            "nodes": [
                {{"name": "qa", "type": "QKDNode"}},
                {{"name": "qb", "type": "QKDNode"}}
            ],
            "qconnections": [
                {{"node1": "qa", "node2": "qb", "attenuation": 0.0,
                  "distance": 1000.0, "polarization_fidelity": {polarization_fidelity}}}
            ],
            "cconnections": [
                {{"node1": "qa", "node2": "qb", "delay": 5000000}}
            ]
        }}"#
    );
    serde_json::from_str(&json).expect("valid topology")
}

fn run_qkd(polarization_fidelity: f64, cascade: bool, keysize: usize, num_keys: u32) -> Simulation {
    let mut config = SimulatorConfig::default();
    config.qkd.cascade_enabled = cascade;
    let mut sim = Simulation::build(&qkd_topology(polarization_fidelity), config).expect("build");
    sim.qkd_push("qa", keysize, num_keys).expect("push");
    sim.init().expect("init");
    sim.timeline.set_stop_time(10_000_000_000_000);
    sim.run().expect("run");
    sim
}

fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[test]
fn test_noiseless_bb84_sifts_matching_keys() {
    let sim = run_qkd(1.0, false, 64, 4);
    let alice = &sim.node("qa").unwrap().key_pool.keys;
    let bob = &sim.node("qb").unwrap().key_pool.keys;
    assert_eq!(alice.len(), 4);
    assert_eq!(bob.len(), 4);
    for (a, b) in alice.iter().zip(bob.iter()) {
        assert_eq!(hamming(a, b), 0, "noiseless sifted keys must agree");
    }
}

#[test]
fn test_noisy_channel_without_cascade_leaves_errors() {
    // 3% polarization error rate: over 4 x 64 sifted bits at least one
    // error is effectively certain, which is exactly what cascade is for
    let sim = run_qkd(0.97, false, 64, 4);
    let alice = &sim.node("qa").unwrap().key_pool.keys;
    let bob = &sim.node("qb").unwrap().key_pool.keys;
    assert_eq!(alice.len(), 4);
    assert_eq!(bob.len(), 4);
    let total_errors: u32 = alice
        .iter()
        .zip(bob.iter())
        .map(|(a, b)| hamming(a, b))
        .sum();
    assert!(total_errors > 0, "expected residual sifting errors at 3% QBER");
}

#[test]
fn test_cascade_corrects_every_key() {
    // Scenario: polarization fidelity 0.97, keysize 128, 10 keys. After
    // cascade both pools hold 10 keys and every pair has Hamming distance 0.
    let sim = run_qkd(0.97, true, 128, 10);
    let alice = &sim.node("qa").unwrap().key_pool.keys;
    let bob = &sim.node("qb").unwrap().key_pool.keys;
    assert_eq!(alice.len(), 10, "alice pool incomplete");
    assert_eq!(bob.len(), 10, "bob pool incomplete");
    for (i, (a, b)) in alice.iter().zip(bob.iter()).enumerate() {
        assert_eq!(a.len(), 16);
        assert_eq!(hamming(a, b), 0, "key {i} differs after cascade");
    }
}

#[test]
fn test_cascade_keys_are_not_degenerate() {
    // Corrected keys still look like key material, not all-zero padding
    let sim = run_qkd(0.97, true, 128, 4);
    let alice = &sim.node("qa").unwrap().key_pool.keys;
    let distinct: std::collections::HashSet<&Vec<u8>> = alice.iter().collect();
    assert_eq!(distinct.len(), alice.len(), "keys repeat");
    for key in alice {
        let ones: u32 = key.iter().map(|b| b.count_ones()).sum();
        assert!((20..=108).contains(&ones), "suspicious bit balance: {ones}");
    }
}
