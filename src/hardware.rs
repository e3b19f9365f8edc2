//! # Hardware Models
//!
//! Quantum memories with coherence decay, the middle-node BSM unit, and the
//! detector / light-source parameter models the protocols consume. Detector
//! dark counts, modulator jitter, and similar device physics stay injected
//! parameters; only what the state manager and the entanglement protocols
//! need is modeled behaviorally.

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;

use crate::kernel::{EventId, ProtocolId, SimTime};
use crate::messages::HeraldSign;
use crate::quantum_manager::StateKey;
use crate::PS_PER_SEC;

/// A photon in flight between a memory and the middle node.
///
/// Carries a reference to the emitting memory's state-manager key; a null
/// photon marks an emission attempt that produced no usable excitation.
#[derive(Debug, Clone)]
pub struct Photon {
    pub src_node: String,
    pub memory_key: StateKey,
    /// Tag shared by both paired generation protocols for one attempt
    pub pair_tag: u64,
    pub protocol: ProtocolId,
    pub round: u8,
    pub is_null: bool,
    pub wavelength_nm: f64,
}

/// One encoded pulse of a BB84 batch.
#[derive(Debug, Clone, Copy)]
pub struct QkdPulse {
    pub index: u32,
    pub basis: bool,
    pub bit: bool,
}

/// A batched BB84 pulse train; channel loss thins it per pulse.
#[derive(Debug, Clone)]
pub struct PulseTrain {
    pub src_node: String,
    pub batch: u32,
    pub pulses: Vec<QkdPulse>,
}

/// Construction-time memory parameters, shared by a node's whole array.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryParams {
    pub raw_fidelity: f64,
    /// Maximum excite rate in Hz
    pub frequency: f64,
    /// Photon emission probability
    pub efficiency: f64,
    pub coherence_time_ps: SimTime,
    /// Expiry fires at coherence_time * cutoff_ratio; values above 1 are
    /// permitted and passed through uninterpreted
    pub cutoff_ratio: f64,
    pub wavelength_nm: f64,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            raw_fidelity: 1.0,
            frequency: 2e3,
            efficiency: 1.0,
            coherence_time_ps: 10 * PS_PER_SEC,
            cutoff_ratio: 1.0,
            wavelength_nm: 500.0,
        }
    }
}

/// Name of the memory slot a remote memory is entangled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMemory {
    pub node: String,
    pub memory: String,
}

/// A single quantum memory slot.
///
/// Fidelity decays with elapsed time since entanglement according to the
/// coherence time; the resource manager mirrors every state change through
/// its memory-info bookkeeping.
#[derive(Debug)]
pub struct Memory {
    pub name: String,
    pub index: usize,
    /// Fidelity recorded at the last entanglement event
    pub fidelity: f64,
    pub raw_fidelity: f64,
    pub frequency: f64,
    pub efficiency: f64,
    pub coherence_time_ps: SimTime,
    pub cutoff_ratio: f64,
    pub wavelength_nm: f64,
    /// Time of the last successful entanglement
    pub generation_time: SimTime,
    pub entangled_memory: Option<RemoteMemory>,
    pub qsm_key: StateKey,
    /// Pending coherence-cutoff expiry event, removed on release
    pub expire_event: Option<EventId>,
    pub observers: Vec<String>,
    rng: ChaCha20Rng,
}

impl Memory {
    pub fn new(name: String, index: usize, params: &MemoryParams, qsm_key: StateKey, rng: ChaCha20Rng) -> Self {
        Self {
            name,
            index,
            fidelity: 0.0,
            raw_fidelity: params.raw_fidelity,
            frequency: params.frequency,
            efficiency: params.efficiency,
            coherence_time_ps: params.coherence_time_ps,
            cutoff_ratio: params.cutoff_ratio,
            wavelength_nm: params.wavelength_nm,
            generation_time: 0,
            entangled_memory: None,
            qsm_key,
            expire_event: None,
            observers: Vec::new(),
            rng,
        }
    }

    /// Register an observer notified on state updates.
    pub fn attach(&mut self, observer: &str) {
        if !self.observers.iter().any(|o| o == observer) {
            self.observers.push(observer.to_string());
        }
    }

    /// Fidelity at `now`, decayed exponentially toward 1/2 over the coherence
    /// time since the entanglement was established.
    pub fn effective_fidelity(&self, now: SimTime) -> f64 {
        if self.entangled_memory.is_none() {
            return self.fidelity;
        }
        let elapsed = now.saturating_sub(self.generation_time) as f64;
        let decay = (-elapsed / self.coherence_time_ps as f64).exp();
        0.5 + (self.fidelity - 0.5) * decay
    }

    /// Simulated time at which the coherence cutoff fires.
    pub fn cutoff_time(&self, entangle_time: SimTime) -> SimTime {
        let window = (self.coherence_time_ps as f64 * self.cutoff_ratio).round() as u64;
        entangle_time.saturating_add(window)
    }

    /// Attempt one photon emission toward the middle node. The efficiency
    /// roll may suppress the photon entirely.
    pub fn excite(
        &mut self,
        src_node: &str,
        pair_tag: u64,
        protocol: ProtocolId,
        round: u8,
    ) -> Option<Photon> {
        if self.rng.gen::<f64>() >= self.efficiency {
            return None;
        }
        Some(Photon {
            src_node: src_node.to_string(),
            memory_key: self.qsm_key,
            pair_tag,
            protocol,
            round,
            is_null: false,
            wavelength_nm: self.wavelength_nm,
        })
    }

    /// Record a successful entanglement with a remote memory.
    pub fn set_entangled(
        &mut self,
        remote: RemoteMemory,
        fidelity: f64,
        entangle_time: SimTime,
    ) {
        self.entangled_memory = Some(remote);
        self.fidelity = fidelity;
        self.generation_time = entangle_time;
    }

    /// Drop the entangled-memory pointer and reset fidelity bookkeeping.
    /// Callers null the pointer before any observer is notified.
    pub fn release(&mut self) {
        self.entangled_memory = None;
        self.fidelity = 0.0;
    }
}

/// The memory bank of one node.
#[derive(Debug)]
pub struct MemoryArray {
    pub name: String,
    pub memories: Vec<Memory>,
}

impl MemoryArray {
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Memory> {
        self.memories.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Memory> {
        self.memories.get_mut(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Memory> {
        self.memories.iter().find(|m| m.name == name)
    }
}

/// Detector parameter model: dark counts and jitter are injected parameters,
/// only the efficiency participates in herald decisions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Detector {
    pub efficiency: f64,
    pub dark_count_rate_hz: f64,
    pub time_resolution_ps: SimTime,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            efficiency: 1.0,
            dark_count_rate_hz: 0.0,
            time_resolution_ps: 150,
        }
    }
}

/// Light-source parameter model for QKD pulse trains.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LightSource {
    pub frequency_hz: f64,
    pub wavelength_nm: f64,
    pub mean_photon_num: f64,
}

impl Default for LightSource {
    fn default() -> Self {
        Self {
            frequency_hz: 8e7,
            wavelength_nm: 1550.0,
            mean_photon_num: 0.1,
        }
    }
}

/// Outcome of a completed coincidence at the middle node.
#[derive(Debug, Clone)]
pub struct HeraldOutcome {
    pub sign: HeraldSign,
    pub ends: [(String, ProtocolId); 2],
    pub round: u8,
}

#[derive(Debug, Clone)]
struct PendingPhoton {
    src_node: String,
    protocol: ProtocolId,
}

/// The Bell-state measurement unit of a middle herald node.
///
/// Photons of one attempt arrive on the shared grid; the second photon of a
/// (pair tag, round) completes the coincidence and draws the herald sign.
#[derive(Debug)]
pub struct BsmUnit {
    pub name: String,
    pub detector: Detector,
    pub observers: Vec<String>,
    pending: HashMap<(u64, u8), PendingPhoton>,
    rng: ChaCha20Rng,
}

impl BsmUnit {
    pub fn new(name: String, detector: Detector, rng: ChaCha20Rng) -> Self {
        Self {
            name,
            detector,
            observers: Vec::new(),
            pending: HashMap::new(),
            rng,
        }
    }

    pub fn attach(&mut self, observer: &str) {
        if !self.observers.iter().any(|o| o == observer) {
            self.observers.push(observer.to_string());
        }
    }

    /// Feed one arriving photon. Returns the herald outcome when this photon
    /// completes a coincidence.
    pub fn receive(&mut self, photon: &Photon) -> Option<HeraldOutcome> {
        if photon.is_null {
            return None;
        }
        if self.rng.gen::<f64>() >= self.detector.efficiency {
            return None;
        }
        let slot = (photon.pair_tag, photon.round);
        match self.pending.remove(&slot) {
            Some(first) if first.src_node != photon.src_node => {
                let sign = if self.rng.gen::<bool>() {
                    HeraldSign::PsiPlus
                } else {
                    HeraldSign::PsiMinus
                };
                Some(HeraldOutcome {
                    sign,
                    ends: [
                        (first.src_node, first.protocol),
                        (photon.src_node.clone(), photon.protocol),
                    ],
                    round: photon.round,
                })
            }
            Some(first) => {
                // Same-source duplicate: keep the original registration
                self.pending.insert(slot, first);
                None
            }
            None => {
                self.pending.insert(
                    slot,
                    PendingPhoton {
                        src_node: photon.src_node.clone(),
                        protocol: photon.protocol,
                    },
                );
                None
            }
        }
    }

    /// Drop any half-registered attempt for a pair tag (round failed).
    pub fn clear_pair(&mut self, pair_tag: u64) {
        self.pending.retain(|(tag, _), _| *tag != pair_tag);
    }

    /// Drop stale half-registrations of earlier rounds for a pair tag.
    pub fn prune_pair_below(&mut self, pair_tag: u64, round: u8) {
        self.pending
            .retain(|(tag, r), _| *tag != pair_tag || *r >= round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::derive_entity_rng;

    fn test_memory(coherence_s: u64) -> Memory {
        let params = MemoryParams {
            raw_fidelity: 0.9,
            coherence_time_ps: coherence_s * PS_PER_SEC,
            ..MemoryParams::default()
        };
        Memory::new("r1.memo[0]".to_string(), 0, &params, 7, derive_entity_rng(0, "r1.memo[0]"))
    }

    #[test]
    fn test_fidelity_decays_toward_half() {
        let mut memory = test_memory(1);
        memory.set_entangled(
            RemoteMemory {
                node: "r2".to_string(),
                memory: "r2.memo[0]".to_string(),
            },
            0.9,
            0,
        );
        assert!((memory.effective_fidelity(0) - 0.9).abs() < 1e-12);
        let after_one_coherence = memory.effective_fidelity(PS_PER_SEC);
        let expected = 0.5 + 0.4 * (-1.0f64).exp();
        assert!((after_one_coherence - expected).abs() < 1e-9);
        assert!(memory.effective_fidelity(100 * PS_PER_SEC) < 0.501);
    }

    #[test]
    fn test_fidelity_never_exceeds_raw() {
        let mut memory = test_memory(1);
        memory.set_entangled(
            RemoteMemory {
                node: "r2".to_string(),
                memory: "r2.memo[0]".to_string(),
            },
            0.9,
            1000,
        );
        for t in [1000, 2000, 1_000_000, PS_PER_SEC] {
            assert!(memory.effective_fidelity(t) <= memory.raw_fidelity + 1e-12);
        }
    }

    #[test]
    fn test_cutoff_scales_with_ratio() {
        let mut memory = test_memory(1);
        memory.cutoff_ratio = 0.5;
        assert_eq!(memory.cutoff_time(1000), 1000 + PS_PER_SEC / 2);
        memory.cutoff_ratio = 2.0;
        assert_eq!(memory.cutoff_time(0), 2 * PS_PER_SEC);
    }

    #[test]
    fn test_perfect_efficiency_always_emits() {
        let mut memory = test_memory(1);
        for round in 0..2 {
            let photon = memory.excite("r1", 5, 9, round);
            let photon = photon.expect("unit efficiency must emit");
            assert_eq!(photon.memory_key, 7);
            assert_eq!(photon.pair_tag, 5);
        }
    }

    #[test]
    fn test_bsm_coincidence_requires_two_sources() {
        let mut bsm = BsmUnit::new(
            "m1.bsm".to_string(),
            Detector::default(),
            derive_entity_rng(0, "m1.bsm"),
        );
        let mut photon_a = Photon {
            src_node: "r1".to_string(),
            memory_key: 0,
            pair_tag: 3,
            protocol: 11,
            round: 0,
            is_null: false,
            wavelength_nm: 500.0,
        };
        assert!(bsm.receive(&photon_a).is_none());
        // Duplicate from the same end does not herald
        assert!(bsm.receive(&photon_a).is_none());
        photon_a.src_node = "r2".to_string();
        photon_a.protocol = 12;
        let outcome = bsm.receive(&photon_a).expect("coincidence heralds");
        assert_eq!(outcome.round, 0);
        let nodes: Vec<&str> = outcome.ends.iter().map(|(n, _)| n.as_str()).collect();
        assert!(nodes.contains(&"r1") && nodes.contains(&"r2"));
    }
}
