//! # Topology Configuration
//!
//! Serde model of the configuration the core consumes: nodes, quantum
//! connections, classical connections, and the stop time. Validation runs at
//! build time; dangling channel endpoints, duplicate names, and unknown node
//! types are fatal configuration errors.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::kernel::SimTime;
use crate::{Result, SimulationError};

/// Stop time accepts either integer picoseconds or the string "Infinity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopTime {
    Finite(u64),
    Named(StopTimeName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopTimeName {
    Infinity,
}

impl StopTime {
    pub fn as_ps(self) -> SimTime {
        match self {
            StopTime::Finite(t) => t,
            StopTime::Named(StopTimeName::Infinity) => SimTime::MAX,
        }
    }
}

/// The closed set of node construction recipes.
pub const NODE_TYPES: [&str; 4] = ["QuantumRouter", "BSMNode", "QKDNode", "DQCNode"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub memo_size: Option<usize>,
    /// Parallel-variant placement hint; ignored by the core
    #[serde(default)]
    pub group: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QConnectionConfig {
    pub node1: String,
    pub node2: String,
    /// dB per meter
    pub attenuation: f64,
    /// Meters
    pub distance: f64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub polarization_fidelity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CConnectionConfig {
    pub node1: String,
    pub node2: String,
    /// One-way delay in picoseconds
    pub delay: SimTime,
}

/// Top-level topology description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub is_parallel: bool,
    #[serde(default)]
    pub stop_time: Option<StopTime>,
    pub nodes: Vec<NodeConfig>,
    #[serde(default, alias = "qchannels")]
    pub qconnections: Vec<QConnectionConfig>,
    #[serde(default, alias = "cchannels")]
    pub cconnections: Vec<CConnectionConfig>,
}

impl TopologyConfig {
    /// Fatal-at-init validation of the declared topology.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(SimulationError::Configuration(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
            if !NODE_TYPES.contains(&node.kind.as_str()) {
                return Err(SimulationError::Configuration(format!(
                    "unknown node type {} on node {}",
                    node.kind, node.name
                )));
            }
        }
        for qc in &self.qconnections {
            for end in [&qc.node1, &qc.node2] {
                if !names.contains(end.as_str()) {
                    return Err(SimulationError::Configuration(format!(
                        "qconnection references unknown node {end}"
                    )));
                }
            }
            if qc.node1 == qc.node2 {
                return Err(SimulationError::Configuration(format!(
                    "qconnection loops on node {}",
                    qc.node1
                )));
            }
        }
        for cc in &self.cconnections {
            for end in [&cc.node1, &cc.node2] {
                if !names.contains(end.as_str()) {
                    return Err(SimulationError::Configuration(format!(
                        "cconnection references unknown node {end}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node_config(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }
}
