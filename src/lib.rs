//! # Quantum Forge Network Simulator
//!
//! A discrete-event simulator for quantum networks. A user describes a network of
//! quantum and classical nodes, optical channels, and memory/detector hardware; the
//! simulator advances simulated time by executing scheduled events in time order and
//! reproduces the emergent behavior of entanglement distribution, purification,
//! swapping, and key distribution protocols layered above physical-device models.
//!
//! ## Architecture Overview
//!
//! The simulator is built from three tightly coupled subsystems:
//!
//! ### Simulation Kernel
//! - **Deterministic scheduling**: events ordered by (time, priority, insertion counter)
//! - **Seeded RNG fanout**: every entity derives its generator from (seed, entity name)
//! - **Stop-time contract**: a run ends on queue exhaustion, stop time, or `stop()`
//! - **Integer picosecond clock**: channel delays computed through exact rational
//!   arithmetic so delivery times never drift across hosts
//!
//! ### Quantum State Manager
//! - **Shared multi-qubit store**: states keyed by memory identifiers, composed on demand
//! - **Selectable formalism**: ket vector, density matrix, or Bell-diagonal, frozen at startup
//! - **Cached operator evaluation**: LRU caches for gate application and measurement
//!
//! ### Entanglement Control Plane
//! - **Resource manager**: per-node memory bookkeeping plus a condition/action rule engine
//! - **Entanglement protocols**: heralded generation, BBPSSW distillation, swapping
//! - **Network manager**: reservation, routing, and forwarding split across two layers
//! - **QKD stack**: BB84 sifting with cascade error correction on the same kernel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quantum_forge_netsim::{Simulation, SimulatorConfig, TopologyConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topo: TopologyConfig = serde_json::from_str(r#"{
//!         "nodes": [
//!             {"name": "r1", "type": "QuantumRouter", "memo_size": 4},
//!             {"name": "m1", "type": "BSMNode"},
//!             {"name": "r2", "type": "QuantumRouter", "memo_size": 4}
//!         ],
//!         "qconnections": [
//!             {"node1": "r1", "node2": "m1", "attenuation": 0.0, "distance": 500.0},
//!             {"node1": "r2", "node2": "m1", "attenuation": 0.0, "distance": 500.0}
//!         ],
//!         "cconnections": [
//!             {"node1": "r1", "node2": "r2", "delay": 5000000}
//!         ],
//!         "stop_time": "Infinity"
//!     }"#)?;
//!
//!     let mut sim = Simulation::build(&topo, SimulatorConfig::default())?;
//!     sim.request("r1", "r2", 1_000_000_000_000, 10_000_000_000_000, 1, 0.9)?;
//!     sim.timeline.set_stop_time(20_000_000_000_000);
//!     sim.run()?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Architecture version for compatibility tracking
pub const ARCHITECTURE_VERSION: &str = "1.0.0-netsim";

/// Propagation speed of light in optical fiber, meters per second.
///
/// Quantum and classical channel delays derive from this constant through the
/// kernel's exact rational arithmetic helper.
pub const FIBER_LIGHT_SPEED_M_S: u64 = 200_000_000;

/// Picoseconds per second, the kernel's base time unit conversion.
pub const PS_PER_SEC: u64 = 1_000_000_000_000;

// Ambient infrastructure modules
pub mod logging; // Structured logging setup shared by library users and tests
pub mod results; // Persisted trial records for experiment post-processing

// Simulation core modules
pub mod channels; // Classical and quantum channel models with attenuation and delay
pub mod hardware; // Quantum memories, BSM units, detectors, light sources, photons
pub mod kernel; // Timeline, events, deterministic scheduling, precise delays
pub mod messages; // Typed classical-message model for every protocol family
pub mod node; // Node kinds, component access, application interface
pub mod quantum_manager; // Shared quantum state store with selectable formalism
pub mod simulation; // Arena owner: nodes, channels, timeline, QSM, dispatch
pub mod topology; // Topology configuration model and validation

// Entanglement control plane modules
pub mod entanglement; // Heralded generation, BBPSSW distillation, swapping
pub mod network_manager; // Reservation protocol, routing, forwarding
pub mod qkd; // BB84 sifting and cascade error correction
pub mod resource_manager; // Memory bookkeeping and the condition/action rule engine

// Re-export main simulation types for convenient access
pub use node::{Application, RequestRecorder};
pub use simulation::{Simulation, SimulatorConfig};
pub use topology::TopologyConfig;

/// Comprehensive error type covering all simulator components and failure modes
///
/// Fatal kinds (`Precondition`, `Configuration`) abort a run before or during
/// dispatch; everything else is reported through resource-manager bookkeeping
/// and network-manager callbacks rather than through this type.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum SimulationError {
    /// Precondition violation - schedule-in-past, unpaired protocol, duplicate entity
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Unknown quantum state key presented to the quantum state manager
    #[error("Unknown quantum state key: {0}")]
    UnknownState(u64),

    /// Gate outside the registered gate table
    #[error("Unknown gate: {0}")]
    UnknownGate(String),

    /// Entity name not registered with the timeline
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// Topology or startup configuration error - fatal at init time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Protocol-level violation that cannot be recovered locally
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing forwarding entry or unroutable destination
    #[error("Routing error: {0}")]
    Routing(String),

    /// Result record serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for all simulator operations
pub type Result<T> = std::result::Result<T, SimulationError>;
