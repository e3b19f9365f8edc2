//! # Nodes
//!
//! A node owns its hardware components by name, a resource manager, a network
//! manager, the live protocol instances, and an optional installed
//! application. Cross-node references are always names resolved through the
//! simulation arena, never owning pointers.

use std::any::Any;
use std::collections::HashMap;

use rand_chacha::ChaCha20Rng;

use crate::hardware::{BsmUnit, Detector, LightSource, MemoryArray};
use crate::kernel::{ProtocolId, SimTime};
use crate::network_manager::{NetworkManager, Reservation};
use crate::qkd::{Bb84, Cascade, KeyPool};
use crate::resource_manager::{MemoryInfo, ResourceManager};
use crate::{Result, SimulationError};

/// The closed set of node construction recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// End-router with memory array and the full protocol stack
    QuantumRouter,
    /// Middle herald node with BSM detectors
    BsmNode,
    /// QKD end-node with optional cascade stack
    QkdNode,
    /// Router extended with data memory for teleportation-based DQC
    DqcNode,
}

impl NodeKind {
    pub fn from_config(kind: &str) -> Result<Self> {
        match kind {
            "QuantumRouter" => Ok(NodeKind::QuantumRouter),
            "BSMNode" => Ok(NodeKind::BsmNode),
            "QKDNode" => Ok(NodeKind::QkdNode),
            "DQCNode" => Ok(NodeKind::DqcNode),
            other => Err(SimulationError::Configuration(format!(
                "unknown node type: {other}"
            ))),
        }
    }
}

/// Borrowed view of one named component.
#[derive(Debug)]
pub enum ComponentRef<'a> {
    Memories(&'a MemoryArray),
    DataMemories(&'a MemoryArray),
    Bsm(&'a BsmUnit),
    Detector(&'a Detector),
    LightSource(&'a LightSource),
}

/// Application callbacks a node exposes to the control plane.
///
/// `get_reserve_res` reports the outcome of a reservation request;
/// `get_memory` fires for every memory-info update that reaches a usable
/// entangled state on the requesting node.
pub trait Application: std::fmt::Debug {
    fn get_reserve_res(&mut self, reservation: &Reservation, accepted: bool);
    fn get_memory(&mut self, info: &MemoryInfo);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Built-in request client that records reservation outcomes and the
/// memories satisfying its filter; integration tests read it back out.
#[derive(Debug, Default)]
pub struct RequestRecorder {
    /// Only record memories entangled with this remote node
    pub target_remote: Option<String>,
    /// Only record memories at or above this fidelity
    pub min_fidelity: f64,
    pub approved: Vec<Reservation>,
    pub rejected: Vec<Reservation>,
    pub memories: Vec<MemoryInfo>,
}

impl RequestRecorder {
    pub fn new(target_remote: &str, min_fidelity: f64) -> Self {
        Self {
            target_remote: Some(target_remote.to_string()),
            min_fidelity,
            ..Self::default()
        }
    }
}

impl Application for RequestRecorder {
    fn get_reserve_res(&mut self, reservation: &Reservation, accepted: bool) {
        if accepted {
            self.approved.push(reservation.clone());
        } else {
            self.rejected.push(reservation.clone());
        }
    }

    fn get_memory(&mut self, info: &MemoryInfo) {
        if let Some(target) = &self.target_remote {
            if info.remote_node.as_deref() != Some(target.as_str()) {
                return;
            }
        }
        if info.fidelity + 1e-12 < self.min_fidelity {
            return;
        }
        self.memories.push(info.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One simulated node.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub memories: Option<MemoryArray>,
    /// DQC data-memory extension
    pub data_memories: Option<MemoryArray>,
    pub bsm: Option<BsmUnit>,
    pub detector: Option<Detector>,
    pub light_source: Option<LightSource>,
    pub resource_manager: ResourceManager,
    pub network_manager: NetworkManager,
    pub protocols: HashMap<ProtocolId, crate::entanglement::ProtocolInstance>,
    pub bb84: Option<Bb84>,
    pub cascade: Option<Cascade>,
    pub key_pool: KeyPool,
    pub app: Option<Box<dyn Application>>,
    /// Observer trigger log: (observer name, detection time)
    pub trigger_log: Vec<(String, SimTime)>,
    pub rng: ChaCha20Rng,
}

impl Node {
    pub fn new(name: String, kind: NodeKind, memory_size: usize, rng: ChaCha20Rng) -> Self {
        Self {
            name,
            kind,
            memories: None,
            data_memories: None,
            bsm: None,
            detector: None,
            light_source: None,
            resource_manager: ResourceManager::new(memory_size),
            network_manager: NetworkManager::default(),
            protocols: HashMap::new(),
            bb84: None,
            cascade: None,
            key_pool: KeyPool::default(),
            app: None,
            trigger_log: Vec::new(),
            rng,
        }
    }

    /// Components addressable by name, e.g. `"r1.MemoryArray"`.
    pub fn get_component_by_name(&self, name: &str) -> Option<ComponentRef<'_>> {
        let suffix = name.strip_prefix(&self.name)?.strip_prefix('.')?;
        match suffix {
            "MemoryArray" => self.memories.as_ref().map(ComponentRef::Memories),
            "DataMemoryArray" => self.data_memories.as_ref().map(ComponentRef::DataMemories),
            "BSM" => self.bsm.as_ref().map(ComponentRef::Bsm),
            "Detector" => self.detector.as_ref().map(ComponentRef::Detector),
            "LightSource" => self.light_source.as_ref().map(ComponentRef::LightSource),
            _ => None,
        }
    }

    /// All components of one kind, e.g. every memory array of a DQC node.
    pub fn get_components_by_type(&self, type_name: &str) -> Vec<ComponentRef<'_>> {
        let mut found = Vec::new();
        match type_name {
            "MemoryArray" => {
                if let Some(array) = &self.memories {
                    found.push(ComponentRef::Memories(array));
                }
                if let Some(array) = &self.data_memories {
                    found.push(ComponentRef::DataMemories(array));
                }
            }
            "BSM" => {
                if let Some(bsm) = &self.bsm {
                    found.push(ComponentRef::Bsm(bsm));
                }
            }
            "Detector" => {
                if let Some(detector) = &self.detector {
                    found.push(ComponentRef::Detector(detector));
                }
            }
            "LightSource" => {
                if let Some(source) = &self.light_source {
                    found.push(ComponentRef::LightSource(source));
                }
            }
            _ => {}
        }
        found
    }

    /// Install an application; subsequent reservation and memory callbacks
    /// are delivered to it.
    pub fn install_app(&mut self, app: Box<dyn Application>) {
        self.app = Some(app);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Memory, MemoryParams};
    use crate::kernel::derive_entity_rng;

    fn router() -> Node {
        let mut node = Node::new(
            "r1".to_string(),
            NodeKind::QuantumRouter,
            2,
            derive_entity_rng(0, "r1"),
        );
        let params = MemoryParams::default();
        let memories = (0..2)
            .map(|i| {
                let name = format!("r1.memo[{i}]");
                let rng = derive_entity_rng(0, &name);
                Memory::new(name, i, &params, i as u64, rng)
            })
            .collect();
        node.memories = Some(MemoryArray {
            name: "r1.MemoryArray".to_string(),
            memories,
        });
        node
    }

    #[test]
    fn test_component_lookup_by_name() {
        let node = router();
        assert!(matches!(
            node.get_component_by_name("r1.MemoryArray"),
            Some(ComponentRef::Memories(_))
        ));
        assert!(node.get_component_by_name("r1.BSM").is_none());
        assert!(node.get_component_by_name("r2.MemoryArray").is_none());
    }

    #[test]
    fn test_components_by_type() {
        let node = router();
        assert_eq!(node.get_components_by_type("MemoryArray").len(), 1);
        assert!(node.get_components_by_type("BSM").is_empty());
    }

    #[test]
    fn test_recorder_filters_by_remote_and_fidelity() {
        let mut recorder = RequestRecorder::new("r3", 0.9);
        let mut info = MemoryInfo {
            index: 0,
            state: crate::resource_manager::MemoryInfoState::Entangled,
            remote_node: Some("r2".to_string()),
            remote_memo: Some("r2.memo[0]".to_string()),
            entangle_time: Some(10),
            fidelity: 0.95,
            reservation: None,
        };
        recorder.get_memory(&info);
        assert!(recorder.memories.is_empty());
        info.remote_node = Some("r3".to_string());
        info.fidelity = 0.85;
        recorder.get_memory(&info);
        assert!(recorder.memories.is_empty());
        info.fidelity = 0.93;
        recorder.get_memory(&info);
        assert_eq!(recorder.memories.len(), 1);
    }
}
