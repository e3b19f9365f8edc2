//! # Simulation Arena
//!
//! The single owner of heavyweight simulation objects: every node, every
//! channel, the timeline, and the shared quantum state manager. All protocol
//! code references entities by name through this arena, never by pointer, so
//! the cyclic node/component/channel graph stays acyclic in ownership.
//!
//! The run loop pops events off the timeline and dispatches them through the
//! typed process table to the owning module.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::channels::{ClassicalChannel, QuantumChannel};
use crate::hardware::{
    BsmUnit, Detector, LightSource, Memory, MemoryArray, MemoryParams, Photon, PulseTrain,
};
use crate::kernel::{
    derive_entity_rng, precise_delay_ps, Process, ProtocolId, SimTime, Timeline, DEFAULT_PRIORITY,
};
use crate::messages::{Message, MessageKind};
use crate::network_manager::{self, TimeCard};
use crate::node::{Application, Node, NodeKind};
use crate::qkd::{Bb84, Cascade};
use crate::quantum_manager::QuantumManager;
use crate::resource_manager::RuleId;
use crate::topology::TopologyConfig;
use crate::{entanglement, qkd, resource_manager, Result, SimulationError, FIBER_LIGHT_SPEED_M_S};

/// Hardware defaults applied to every node the topology does not override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub memory: MemoryParams,
    pub detector: Detector,
    pub light_source: LightSource,
    /// Generation attempts before the protocol reports failure
    pub generation_attempts: u32,
    pub swap_success_prob: f64,
    pub swap_degradation: f64,
    /// Polarization fidelity for quantum connections that do not declare one
    pub polarization_fidelity: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            memory: MemoryParams::default(),
            detector: Detector::default(),
            light_source: LightSource::default(),
            generation_attempts: 8,
            swap_success_prob: 1.0,
            swap_degradation: 1.0,
            polarization_fidelity: 1.0,
        }
    }
}

/// QKD stack parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QkdConfig {
    pub batch_size: usize,
    pub cascade_enabled: bool,
    pub cascade_passes: u32,
    pub cascade_block: usize,
}

impl Default for QkdConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            cascade_enabled: true,
            cascade_passes: 4,
            cascade_block: 16,
        }
    }
}

/// Startup configuration of one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub seed: u64,
    /// Registered formalism name: "ket", "fock_density", "bell_diagonal"
    pub formalism: String,
    pub cache_capacity: usize,
    /// Emit a progress line every this many executed events
    pub progress_interval: Option<u64>,
    /// Use the distributed distance-vector routing variant
    pub distance_vector_routing: bool,
    /// Default memory bank size for nodes that do not declare one
    pub default_memo_size: usize,
    pub hardware: HardwareConfig,
    pub qkd: QkdConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            formalism: "ket".to_string(),
            cache_capacity: 512,
            progress_interval: None,
            distance_vector_routing: false,
            default_memo_size: 8,
            hardware: HardwareConfig::default(),
            qkd: QkdConfig::default(),
        }
    }
}

/// The arena owner; see the module docs.
#[derive(Debug)]
pub struct Simulation {
    pub timeline: Timeline,
    pub qsm: QuantumManager,
    pub config: SimulatorConfig,
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    cchannels: HashMap<(String, String), ClassicalChannel>,
    qchannels: HashMap<(String, String), QuantumChannel>,
    next_protocol: ProtocolId,
    next_rule: RuleId,
}

impl Simulation {
    /// Build a simulation from a validated topology.
    ///
    /// # Errors
    ///
    /// Configuration errors (dangling endpoints, unknown node types or
    /// formalism, QKD nodes without a peer) are fatal here, before any event
    /// runs.
    pub fn build(topology: &TopologyConfig, config: SimulatorConfig) -> Result<Self> {
        topology.validate()?;
        let mut timeline = Timeline::new(config.seed);
        if let Some(stop) = topology.stop_time {
            timeline.set_stop_time(stop.as_ps());
        }
        timeline.progress_interval = config.progress_interval;
        let mut qsm = QuantumManager::with_formalism_name(&config.formalism, config.cache_capacity)?;

        let mut nodes = Vec::with_capacity(topology.nodes.len());
        let mut node_index = HashMap::new();
        for node_config in &topology.nodes {
            let kind = NodeKind::from_config(&node_config.kind)?;
            let seed = node_config.seed.unwrap_or(config.seed);
            let name = node_config.name.clone();
            let memo_size = match kind {
                NodeKind::QuantumRouter | NodeKind::DqcNode => {
                    node_config.memo_size.unwrap_or(config.default_memo_size)
                }
                _ => 0,
            };
            let mut node = Node::new(name.clone(), kind, memo_size, derive_entity_rng(seed, &name));
            match kind {
                NodeKind::QuantumRouter | NodeKind::DqcNode => {
                    node.memories = Some(build_memory_array(
                        &mut qsm,
                        &name,
                        "memo",
                        memo_size,
                        seed,
                        &config.hardware.memory,
                    )?);
                    if kind == NodeKind::DqcNode {
                        node.data_memories = Some(build_memory_array(
                            &mut qsm,
                            &name,
                            "dmemo",
                            memo_size,
                            seed,
                            &config.hardware.memory,
                        )?);
                    }
                    node.network_manager.timecards = vec![TimeCard::default(); memo_size];
                }
                NodeKind::BsmNode => {
                    let bsm_name = format!("{name}.bsm");
                    node.bsm = Some(BsmUnit::new(
                        bsm_name.clone(),
                        config.hardware.detector.clone(),
                        derive_entity_rng(seed, &bsm_name),
                    ));
                    node.detector = Some(config.hardware.detector.clone());
                }
                NodeKind::QkdNode => {
                    node.detector = Some(config.hardware.detector.clone());
                    node.light_source = Some(config.hardware.light_source.clone());
                }
            }
            node_index.insert(name, nodes.len());
            nodes.push(node);
        }

        let mut sim = Self {
            timeline,
            qsm,
            config,
            nodes,
            node_index,
            cchannels: HashMap::new(),
            qchannels: HashMap::new(),
            next_protocol: 0,
            next_rule: 0,
        };
        sim.build_channels(topology)?;
        sim.build_routing(topology)?;
        sim.build_qkd_stacks(topology)?;
        info!(
            nodes = sim.nodes.len(),
            qchannels = sim.qchannels.len(),
            cchannels = sim.cchannels.len(),
            "simulation built"
        );
        Ok(sim)
    }

    fn build_channels(&mut self, topology: &TopologyConfig) -> Result<()> {
        let seed = self.config.seed;
        for qc in &topology.qconnections {
            let polarization = qc
                .polarization_fidelity
                .unwrap_or(self.config.hardware.polarization_fidelity);
            for (a, b) in [(&qc.node1, &qc.node2), (&qc.node2, &qc.node1)] {
                let name = format!("qc.{a}.{b}");
                self.qchannels.insert(
                    (a.clone(), b.clone()),
                    QuantumChannel::new(
                        name.clone(),
                        a.clone(),
                        b.clone(),
                        qc.distance,
                        qc.attenuation,
                        polarization,
                        derive_entity_rng(seed, &name),
                    ),
                );
            }
        }
        for cc in &topology.cconnections {
            for (a, b) in [(&cc.node1, &cc.node2), (&cc.node2, &cc.node1)] {
                self.cchannels.insert(
                    (a.clone(), b.clone()),
                    ClassicalChannel::with_delay(
                        format!("cc.{a}.{b}"),
                        a.clone(),
                        b.clone(),
                        cc.delay,
                    ),
                );
            }
        }
        // Every physically connected pair also gets a classical channel; the
        // delay follows the shortest fiber path through the quantum graph
        let distances = physical_distances(topology);
        for ((a, b), meters) in distances {
            if a == b || self.cchannels.contains_key(&(a.clone(), b.clone())) {
                continue;
            }
            self.cchannels.insert(
                (a.clone(), b.clone()),
                ClassicalChannel::from_length(format!("cc.{a}.{b}"), a, b, meters),
            );
        }
        Ok(())
    }

    fn build_routing(&mut self, topology: &TopologyConfig) -> Result<()> {
        // Collapse each herald node onto a router-level edge between its two
        // quantum-connected neighbors; direct links stay as-is
        let mut adjacency: HashMap<String, Vec<(String, u64)>> = HashMap::new();
        let mut add_edge = |a: &str, b: &str, cost: u64, adjacency: &mut HashMap<String, Vec<(String, u64)>>| {
            adjacency.entry(a.to_string()).or_default().push((b.to_string(), cost));
            adjacency.entry(b.to_string()).or_default().push((a.to_string(), cost));
        };
        let kind_of = |name: &str| -> Result<NodeKind> {
            let index = self.node_index.get(name).ok_or_else(|| {
                SimulationError::UnknownEntity(name.to_string())
            })?;
            Ok(self.nodes[*index].kind)
        };
        let mut bsm_links: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for qc in &topology.qconnections {
            let kind1 = kind_of(&qc.node1)?;
            let kind2 = kind_of(&qc.node2)?;
            match (kind1, kind2) {
                (NodeKind::BsmNode, NodeKind::BsmNode) => {
                    return Err(SimulationError::Configuration(format!(
                        "herald nodes {} and {} cannot share a quantum connection",
                        qc.node1, qc.node2
                    )));
                }
                (NodeKind::BsmNode, _) => {
                    bsm_links
                        .entry(qc.node1.clone())
                        .or_default()
                        .push((qc.node2.clone(), qc.distance));
                }
                (_, NodeKind::BsmNode) => {
                    bsm_links
                        .entry(qc.node2.clone())
                        .or_default()
                        .push((qc.node1.clone(), qc.distance));
                }
                _ => {
                    let cost = precise_delay_ps(qc.distance, FIBER_LIGHT_SPEED_M_S);
                    add_edge(&qc.node1, &qc.node2, cost, &mut adjacency);
                }
            }
        }
        for (bsm, ends) in &bsm_links {
            if ends.len() != 2 {
                return Err(SimulationError::Configuration(format!(
                    "herald node {bsm} must connect exactly two routers, found {}",
                    ends.len()
                )));
            }
            let (left, left_len) = &ends[0];
            let (right, right_len) = &ends[1];
            let cost = precise_delay_ps(*left_len, FIBER_LIGHT_SPEED_M_S)
                + precise_delay_ps(*right_len, FIBER_LIGHT_SPEED_M_S);
            add_edge(left, right, cost, &mut adjacency);
            for (a, b) in [(left, right), (right, left)] {
                let index = self.node_index[a.as_str()];
                self.nodes[index]
                    .network_manager
                    .mids
                    .insert(b.clone(), bsm.clone());
            }
        }
        for (name, edges) in &adjacency {
            let index = self.node_index[name.as_str()];
            let mut neighbors = edges.clone();
            neighbors.sort();
            neighbors.dedup();
            self.nodes[index].network_manager.neighbors = neighbors;
        }
        if !self.config.distance_vector_routing {
            let tables = network_manager::static_forwarding(&adjacency);
            for (name, table) in tables {
                if let Some(&index) = self.node_index.get(name.as_str()) {
                    self.nodes[index].network_manager.forwarding = table;
                }
            }
        }
        Ok(())
    }

    fn build_qkd_stacks(&mut self, topology: &TopologyConfig) -> Result<()> {
        let qkd_nodes: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::QkdNode)
            .map(|n| n.name.clone())
            .collect();
        for name in qkd_nodes {
            let peer = topology
                .qconnections
                .iter()
                .find_map(|qc| {
                    if qc.node1 == name {
                        Some(qc.node2.clone())
                    } else if qc.node2 == name {
                        Some(qc.node1.clone())
                    } else {
                        None
                    }
                })
                .ok_or_else(|| {
                    SimulationError::Configuration(format!(
                        "QKD node {name} has no quantum connection"
                    ))
                })?;
            let index = self.node_index[name.as_str()];
            let node = &mut self.nodes[index];
            node.bb84 = Some(Bb84::new(
                name.clone(),
                peer.clone(),
                self.config.qkd.batch_size,
            ));
            if self.config.qkd.cascade_enabled {
                node.cascade = Some(Cascade::new(
                    name.clone(),
                    peer,
                    self.config.qkd.cascade_passes,
                    self.config.qkd.cascade_block,
                ));
            }
        }
        Ok(())
    }

    /// Prepare the timeline and, for the distributed routing variant, kick
    /// off the initial advertisements.
    pub fn init(&mut self) -> Result<()> {
        self.timeline.init();
        if self.config.distance_vector_routing {
            let routers: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !n.network_manager.neighbors.is_empty())
                .map(|n| n.name.clone())
                .collect();
            for router in routers {
                network_manager::start_distance_vector(self, &router)?;
            }
        }
        Ok(())
    }

    /// Execute events in time order until the queue drains, the stop time is
    /// reached, or `stop()` is called. Fatal errors abort the run.
    pub fn run(&mut self) -> Result<()> {
        self.timeline.begin_run();
        while self.timeline.is_running() {
            let Some(event) = self.timeline.next_event() else {
                break;
            };
            self.dispatch(event.process)?;
        }
        self.timeline.stop();
        info!(
            executed = self.timeline.executed_events(),
            now_ps = self.timeline.now(),
            "run finished"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.timeline.stop();
    }

    pub fn now(&self) -> SimTime {
        self.timeline.now()
    }

    fn dispatch(&mut self, process: Process) -> Result<()> {
        match process {
            Process::DeliverMessage { dst, src, message } => {
                self.receive_message(&dst, &src, message)
            }
            Process::DeliverPhoton { dst, photon } => entanglement::bsm_photon(self, &dst, photon),
            Process::DeliverPulseTrain { dst, src, train } => {
                qkd::receive_pulse_train(self, &dst, &src, train)
            }
            Process::StartProtocol { node, protocol } => {
                entanglement::start_protocol(self, &node, protocol)
            }
            Process::EmitRound {
                node,
                protocol,
                round,
            } => entanglement::emit_round(self, &node, protocol, round),
            Process::ResolveRounds { node, protocol } => {
                entanglement::resolve_rounds(self, &node, protocol)
            }
            Process::ExpireMemory { node, index } => entanglement::expire_memory(self, &node, index),
            Process::InstallRules { node, reservation } => {
                network_manager::install_reservation(self, &node, &reservation)
            }
            Process::ExpireRules { node, reservation } => {
                network_manager::expire_reservation(self, &node, &reservation)
            }
            Process::EmitPulseTrain { node, batch } => qkd::emit_pulse_train(self, &node, batch),
        }
    }

    /// Route an arriving classical message to the owning subsystem.
    fn receive_message(&mut self, dst: &str, src: &str, message: Message) -> Result<()> {
        debug!(dst, src, kind = ?std::mem::discriminant(&message.kind), "message received");
        match message.kind {
            MessageKind::Generation(msg) => {
                entanglement::handle_generation_msg(self, dst, src, msg)
            }
            MessageKind::Purification(msg) => {
                entanglement::handle_purification_msg(self, dst, src, msg)
            }
            MessageKind::Swapping(msg) => entanglement::handle_swapping_msg(self, dst, src, msg),
            MessageKind::Pairing(msg) => resource_manager::handle_pairing(self, dst, src, msg),
            MessageKind::Reservation(msg) => {
                network_manager::handle_reservation(self, dst, src, msg)
            }
            MessageKind::Routing(msg) => network_manager::handle_routing(self, dst, src, msg),
            MessageKind::Bb84(msg) => qkd::handle_bb84(self, dst, src, msg),
            MessageKind::Cascade(msg) => qkd::handle_cascade(self, dst, src, msg),
        }
    }

    // -----------------------------------------------------------------------
    // Entity access
    // -----------------------------------------------------------------------

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.node_index
            .get(name)
            .map(|&index| &self.nodes[index])
            .ok_or_else(|| SimulationError::UnknownEntity(name.to_string()))
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        match self.node_index.get(name) {
            Some(&index) => Ok(&mut self.nodes[index]),
            None => Err(SimulationError::UnknownEntity(name.to_string())),
        }
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|n| n.name.clone()).collect();
        names.sort();
        names
    }

    pub fn next_protocol_id(&mut self) -> ProtocolId {
        let id = self.next_protocol;
        self.next_protocol += 1;
        id
    }

    pub fn next_rule_id(&mut self) -> RuleId {
        let id = self.next_rule;
        self.next_rule += 1;
        id
    }

    /// Install an application on a node.
    pub fn install_app(&mut self, node_name: &str, app: Box<dyn Application>) -> Result<()> {
        self.node_mut(node_name)?.install_app(app);
        Ok(())
    }

    /// Application-facing reservation request (see the network manager).
    pub fn request(
        &mut self,
        node_name: &str,
        responder: &str,
        start_time: SimTime,
        end_time: SimTime,
        memory_size: usize,
        target_fidelity: f64,
    ) -> Result<()> {
        network_manager::request(
            self,
            node_name,
            responder,
            start_time,
            end_time,
            memory_size,
            target_fidelity,
        )
    }

    /// Upper-layer QKD request on the Alice side.
    pub fn qkd_push(&mut self, node_name: &str, keysize: usize, num_keys: u32) -> Result<()> {
        qkd::push(self, node_name, keysize, num_keys)
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    pub fn cchannel_delay(&self, src: &str, dst: &str) -> Result<SimTime> {
        self.cchannels
            .get(&(src.to_string(), dst.to_string()))
            .map(|channel| channel.delay_ps)
            .ok_or_else(|| {
                SimulationError::Routing(format!("no classical channel {src} -> {dst}"))
            })
    }

    pub fn qchannel_delay(&self, src: &str, dst: &str) -> Result<SimTime> {
        self.qchannels
            .get(&(src.to_string(), dst.to_string()))
            .map(|channel| channel.delay_ps)
            .ok_or_else(|| SimulationError::Routing(format!("no quantum channel {src} -> {dst}")))
    }

    /// Transmit a classical message; delivery is reliable and in order, with
    /// the message priority propagated unchanged to the delivery event.
    pub fn send_message(&mut self, src: &str, dst: &str, kind: MessageKind) -> Result<()> {
        self.transmit_message(src, dst, Message::new(kind), false)
    }

    /// Transmit with the delivery priority pinned to the insertion counter,
    /// preserving submission order across channels at time ties.
    pub fn send_message_counter_pinned(
        &mut self,
        src: &str,
        dst: &str,
        kind: MessageKind,
    ) -> Result<()> {
        self.transmit_message(src, dst, Message::new(kind), true)
    }

    fn transmit_message(
        &mut self,
        src: &str,
        dst: &str,
        message: Message,
        counter_pinned: bool,
    ) -> Result<()> {
        let delay = self.cchannel_delay(src, dst)?;
        let at = self.timeline.now() + delay;
        let process = Process::DeliverMessage {
            dst: dst.to_string(),
            src: src.to_string(),
            message: message.clone(),
        };
        if counter_pinned {
            self.timeline.schedule_counter_pinned(at, process)?;
        } else {
            self.timeline.schedule(at, message.priority, process)?;
        }
        Ok(())
    }

    /// Transmit one photon; channel loss may drop it silently.
    pub fn transmit_photon(&mut self, src: &str, dst: &str, photon: Photon) -> Result<()> {
        let (survives, delay) = {
            let channel = self
                .qchannels
                .get_mut(&(src.to_string(), dst.to_string()))
                .ok_or_else(|| {
                    SimulationError::Routing(format!("no quantum channel {src} -> {dst}"))
                })?;
            (channel.photon_survives(), channel.delay_ps)
        };
        if !survives {
            debug!(src, dst, "photon lost in transit");
            return Ok(());
        }
        let at = self.timeline.now() + delay;
        self.timeline.schedule(
            at,
            0,
            Process::DeliverPhoton {
                dst: dst.to_string(),
                photon,
            },
        )?;
        Ok(())
    }

    /// Transmit a QKD pulse train; loss and polarization flips are rolled per
    /// pulse, and the surviving subset arrives in one delivery.
    pub fn transmit_train(&mut self, src: &str, dst: &str, train: PulseTrain) -> Result<()> {
        let (surviving, delay) = {
            let channel = self
                .qchannels
                .get_mut(&(src.to_string(), dst.to_string()))
                .ok_or_else(|| {
                    SimulationError::Routing(format!("no quantum channel {src} -> {dst}"))
                })?;
            let mut surviving = Vec::with_capacity(train.pulses.len());
            for mut pulse in train.pulses {
                if !channel.photon_survives() {
                    continue;
                }
                if channel.polarization_flip() {
                    pulse.bit = !pulse.bit;
                }
                surviving.push(pulse);
            }
            (surviving, channel.delay_ps)
        };
        let at = self.timeline.now() + delay;
        self.timeline.schedule(
            at,
            DEFAULT_PRIORITY,
            Process::DeliverPulseTrain {
                dst: dst.to_string(),
                src: src.to_string(),
                train: PulseTrain {
                    src_node: train.src_node,
                    batch: train.batch,
                    pulses: surviving,
                },
            },
        )?;
        Ok(())
    }

    /// Set the local single-qubit state of one memory in the shared store.
    pub fn update_memory_state(
        &mut self,
        node_name: &str,
        index: usize,
        amplitudes: &[num_complex::Complex64],
    ) -> Result<()> {
        let key = {
            let node = self.node(node_name)?;
            node.memories
                .as_ref()
                .and_then(|array| array.get(index))
                .map(|memory| memory.qsm_key)
                .ok_or_else(|| {
                    SimulationError::Precondition(format!(
                        "memory index {index} out of range on {node_name}"
                    ))
                })?
        };
        self.qsm.set(&[key], amplitudes)
    }

    /// Per-node memory-info snapshots sorted by node name, for determinism
    /// checks and persisted results.
    pub fn memory_snapshot(&self) -> Vec<(String, Vec<crate::resource_manager::MemoryInfo>)> {
        let mut snapshot: Vec<(String, Vec<crate::resource_manager::MemoryInfo>)> = self
            .nodes
            .iter()
            .map(|node| {
                (
                    node.name.clone(),
                    node.resource_manager.memory_manager.infos.clone(),
                )
            })
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

fn build_memory_array(
    qsm: &mut QuantumManager,
    node_name: &str,
    prefix: &str,
    size: usize,
    seed: u64,
    params: &MemoryParams,
) -> Result<MemoryArray> {
    let ground = [
        num_complex::Complex64::new(1.0, 0.0),
        num_complex::Complex64::new(0.0, 0.0),
    ];
    let mut memories = Vec::with_capacity(size);
    for index in 0..size {
        let name = format!("{node_name}.{prefix}[{index}]");
        let key = qsm.new_key(&ground)?;
        memories.push(Memory::new(
            name.clone(),
            index,
            params,
            key,
            derive_entity_rng(seed, &name),
        ));
    }
    Ok(MemoryArray {
        name: format!("{node_name}.{}", if prefix == "memo" { "MemoryArray" } else { "DataMemoryArray" }),
        memories,
    })
}

/// All-pairs shortest fiber distances over the quantum-connection graph.
fn physical_distances(topology: &TopologyConfig) -> HashMap<(String, String), f64> {
    let mut adjacency: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
    for qc in &topology.qconnections {
        adjacency
            .entry(qc.node1.as_str())
            .or_default()
            .push((qc.node2.as_str(), qc.distance));
        adjacency
            .entry(qc.node2.as_str())
            .or_default()
            .push((qc.node1.as_str(), qc.distance));
    }
    let mut out = HashMap::new();
    for &source in adjacency.keys() {
        // Dijkstra over f64 lengths snapped to picometers for ordering
        let mut dist: HashMap<&str, u64> = HashMap::new();
        let mut heap = std::collections::BinaryHeap::new();
        dist.insert(source, 0);
        heap.push(std::cmp::Reverse((0u64, source)));
        while let Some(std::cmp::Reverse((cost, here))) = heap.pop() {
            if dist.get(here).copied().unwrap_or(u64::MAX) < cost {
                continue;
            }
            let Some(edges) = adjacency.get(here) else { continue };
            for (next, meters) in edges {
                let weight = (meters * 1e12).round() as u64;
                let candidate = cost + weight;
                if candidate < dist.get(*next).copied().unwrap_or(u64::MAX) {
                    dist.insert(next, candidate);
                    heap.push(std::cmp::Reverse((candidate, *next)));
                }
            }
        }
        for (target, picometers) in dist {
            if target != source {
                out.insert(
                    (source.to_string(), target.to_string()),
                    picometers as f64 / 1e12,
                );
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_topology() -> TopologyConfig {
        serde_json::from_str(
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
        .expect("valid topology")
    }

    #[test]
    fn test_build_line_topology() {
        let sim = Simulation::build(&line_topology(), SimulatorConfig::default()).unwrap();
        assert_eq!(sim.node_names(), vec!["m1", "r1", "r2"]);
        let r1 = sim.node("r1").unwrap();
        assert_eq!(r1.memories.as_ref().unwrap().len(), 4);
        assert_eq!(r1.network_manager.mids["r2"], "m1");
        assert_eq!(r1.network_manager.forwarding["r2"], "r2");
        assert!(sim.node("m1").unwrap().bsm.is_some());
    }

    #[test]
    fn test_auto_classical_channels_follow_fiber_distance() {
        let sim = Simulation::build(&line_topology(), SimulatorConfig::default()).unwrap();
        // r1 -> m1 is 500 m, r1 -> r2 is 1000 m through the herald node
        assert_eq!(sim.cchannel_delay("r1", "m1").unwrap(), 2_500_000);
        assert_eq!(sim.cchannel_delay("r1", "r2").unwrap(), 5_000_000);
        assert_eq!(
            sim.cchannel_delay("r1", "r2").unwrap(),
            sim.cchannel_delay("r2", "r1").unwrap()
        );
    }

    #[test]
    fn test_declared_cconnection_overrides_auto_delay() {
        let mut topology = line_topology();
        topology.cconnections.push(crate::topology::CConnectionConfig {
            node1: "r1".to_string(),
            node2: "r2".to_string(),
            delay: 1_000_000,
        });
        let sim = Simulation::build(&topology, SimulatorConfig::default()).unwrap();
        assert_eq!(sim.cchannel_delay("r1", "r2").unwrap(), 1_000_000);
    }

    #[test]
    fn test_unknown_node_is_an_error() {
        let sim = Simulation::build(&line_topology(), SimulatorConfig::default()).unwrap();
        assert!(matches!(
            sim.node("ghost"),
            Err(SimulationError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_memory_keys_are_distinct() {
        let sim = Simulation::build(&line_topology(), SimulatorConfig::default()).unwrap();
        let mut keys = Vec::new();
        for name in ["r1", "r2"] {
            let node = sim.node(name).unwrap();
            for memory in &node.memories.as_ref().unwrap().memories {
                keys.push(memory.qsm_key);
            }
        }
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 8);
    }
}
