//! # Resource Manager
//!
//! Per-node bookkeeping of memory state plus the condition/action rule engine.
//! The memory manager is the single source of truth for rule conditions; every
//! hardware-level state change is mirrored here through [`update`].
//!
//! Rule conditions and actions are small value types carrying their
//! closed-over parameters explicitly; the dispatcher interprets them through a
//! typed table of rule kinds (`eg_rule`, `ep_rule`, `es_rule_a`, `es_rule_b`).
//! An action creates at most one protocol instance per firing and yields
//! per-remote-node pairing requirements; the engine ships a pairing message
//! carrying the matcher to each remote node, which applies it against its
//! active protocols and responds.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entanglement::{
    Bbpssw, EntanglementGeneration, GenStage, ProtocolInstance, SwappingA, SwappingB,
};
use crate::kernel::{ProtocolId, SimTime};
use crate::messages::{MessageKind, PairingMsg};
use crate::network_manager::ReservationId;
use crate::simulation::Simulation;
use crate::{Result, SimulationError};

/// Unique rule identifier within a simulation.
pub type RuleId = u64;

/// Logical state tag of one memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryInfoState {
    Raw,
    Occupied,
    Entangled,
    Purified,
}

impl MemoryInfoState {
    /// Entangled and purified memories both hold a usable pair.
    pub fn holds_pair(self) -> bool {
        matches!(self, MemoryInfoState::Entangled | MemoryInfoState::Purified)
    }
}

/// The resource manager's shadow of a single physical memory's logical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub index: usize,
    pub state: MemoryInfoState,
    pub remote_node: Option<String>,
    pub remote_memo: Option<String>,
    pub entangle_time: Option<SimTime>,
    pub fidelity: f64,
    pub reservation: Option<ReservationId>,
}

impl MemoryInfo {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: MemoryInfoState::Raw,
            remote_node: None,
            remote_memo: None,
            entangle_time: None,
            fidelity: 0.0,
            reservation: None,
        }
    }
}

/// One MemoryInfo per physical slot.
#[derive(Debug, Default)]
pub struct MemoryManager {
    pub infos: Vec<MemoryInfo>,
}

impl MemoryManager {
    pub fn new(size: usize) -> Self {
        Self {
            infos: (0..size).map(MemoryInfo::new).collect(),
        }
    }
}

/// Typed arguments of the generation rule.
#[derive(Debug, Clone)]
pub struct EgArgs {
    pub mid: String,
    pub neighbor: String,
    pub indexes: Vec<usize>,
    pub primary: bool,
}

/// Typed arguments of the purification rule.
#[derive(Debug, Clone)]
pub struct EpArgs {
    pub target_fidelity: f64,
}

/// Typed arguments of the swapping A-role rule.
#[derive(Debug, Clone)]
pub struct EsAArgs {
    pub left: String,
    pub right: String,
    pub target_fidelity: f64,
}

/// Typed arguments of the swapping B-role rule.
#[derive(Debug, Clone)]
pub struct EsBArgs {
    pub swappers: Vec<String>,
    pub target_fidelity: f64,
}

/// The interpreted rule table.
#[derive(Debug, Clone)]
pub enum RuleKind {
    EgRule(EgArgs),
    EpRule(EpArgs),
    EsRuleA(EsAArgs),
    EsRuleB(EsBArgs),
}

/// A (priority, condition, action) tuple bound to exactly one reservation.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub priority: u32,
    pub reservation: ReservationId,
    pub kind: RuleKind,
}

/// Matcher shipped inside pairing requests and applied against the remote
/// node's active protocols.
#[derive(Debug, Clone)]
pub enum ReqMatcher {
    /// Matches a waiting generation protocol toward the same middle and peer
    Generation {
        mid: String,
        peer: String,
        reservation: ReservationId,
    },
    /// Creates the passive purification instance over the named memories
    Purification {
        kept_memo: String,
        meas_memo: String,
        reservation: ReservationId,
        target_fidelity: f64,
    },
    /// Matches a waiting swapping B role holding the named memory
    SwapB { expected_memo: String },
}

/// Matcher a waiting (passive) protocol registers itself under.
#[derive(Debug, Clone)]
enum WaitMatcher {
    Generation {
        mid: String,
        peer: String,
        reservation: ReservationId,
    },
    SwapB { memo_name: String },
}

#[derive(Debug, Clone)]
struct WaitingEntry {
    protocol: ProtocolId,
    matcher: WaitMatcher,
}

#[derive(Debug, Clone)]
struct PendingPair {
    from_node: String,
    from_protocol: ProtocolId,
    matcher: ReqMatcher,
}

/// Per-node resource manager: memory manager plus the rule engine state.
#[derive(Debug, Default)]
pub struct ResourceManager {
    pub memory_manager: MemoryManager,
    rules: Vec<Rule>,
    waiting: Vec<WaitingEntry>,
    pending_pairs: Vec<PendingPair>,
}

impl ResourceManager {
    pub fn new(memory_size: usize) -> Self {
        Self {
            memory_manager: MemoryManager::new(memory_size),
            rules: Vec::new(),
            waiting: Vec::new(),
            pending_pairs: Vec::new(),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn info(&self, index: usize) -> Option<&MemoryInfo> {
        self.memory_manager.infos.get(index)
    }
}

enum RuleFire {
    Eg { index: usize },
    Ep { kept: usize, meas: usize, remote: String },
    EsA { left_index: usize, right_index: usize },
    EsB { index: usize },
}

/// Mirror a hardware-level state change into the memory manager, rescan the
/// rule table, and notify the installed application of usable pairs.
pub fn update(sim: &mut Simulation, node_name: &str, index: usize, state: MemoryInfoState) -> Result<()> {
    {
        let node = sim.node_mut(node_name)?;
        let (fidelity, remote_node, remote_memo, entangle_time) = {
            let memory = node
                .memories
                .as_ref()
                .and_then(|array| array.get(index))
                .ok_or_else(|| {
                    SimulationError::Precondition(format!(
                        "memory index {index} out of range on {node_name}"
                    ))
                })?;
            (
                memory.fidelity,
                memory.entangled_memory.as_ref().map(|r| r.node.clone()),
                memory.entangled_memory.as_ref().map(|r| r.memory.clone()),
                memory.generation_time,
            )
        };
        let info = &mut node.resource_manager.memory_manager.infos[index];
        info.state = state;
        if state.holds_pair() {
            info.fidelity = fidelity;
            info.remote_node = remote_node;
            info.remote_memo = remote_memo;
            info.entangle_time = Some(entangle_time);
        } else {
            info.fidelity = 0.0;
            info.remote_node = None;
            info.remote_memo = None;
            info.entangle_time = None;
        }
    }

    if state.holds_pair() {
        notify_application(sim, node_name, index)?;
    }
    evaluate_rules(sim, node_name)
}

fn notify_application(sim: &mut Simulation, node_name: &str, index: usize) -> Result<()> {
    let info = sim.node(node_name)?.resource_manager.memory_manager.infos[index].clone();
    let mut app = match sim.node_mut(node_name)?.app.take() {
        Some(app) => app,
        None => return Ok(()),
    };
    app.get_memory(&info);
    sim.node_mut(node_name)?.app = Some(app);
    Ok(())
}

/// Install a rule and evaluate it against the current memory state.
pub fn install_rule(sim: &mut Simulation, node_name: &str, rule: Rule) -> Result<()> {
    {
        let rm = &mut sim.node_mut(node_name)?.resource_manager;
        rm.rules.push(rule);
        rm.rules.sort_by_key(|r| (r.priority, r.id));
    }
    evaluate_rules(sim, node_name)
}

/// Scan rules in priority order, firing conditions until quiescent.
pub fn evaluate_rules(sim: &mut Simulation, node_name: &str) -> Result<()> {
    loop {
        let fire = {
            let node = sim.node(node_name)?;
            let now = sim.timeline.now();
            let mut fired = None;
            for rule in &node.resource_manager.rules {
                if let Some(f) = match_condition(sim, node_name, rule, now)? {
                    fired = Some((rule.clone(), f));
                    break;
                }
            }
            fired
        };
        match fire {
            Some((rule, f)) => execute_action(sim, node_name, &rule, f)?,
            None => return Ok(()),
        }
    }
}

fn effective_fidelity(sim: &Simulation, node_name: &str, info: &MemoryInfo, now: SimTime) -> f64 {
    sim.node(node_name)
        .ok()
        .and_then(|node| node.memories.as_ref())
        .and_then(|array| array.get(info.index))
        .map(|memory| memory.effective_fidelity(now))
        .unwrap_or(info.fidelity)
}

fn match_condition(
    sim: &Simulation,
    node_name: &str,
    rule: &Rule,
    now: SimTime,
) -> Result<Option<RuleFire>> {
    let node = sim.node(node_name)?;
    let infos = &node.resource_manager.memory_manager.infos;
    let reserved = |info: &MemoryInfo| info.reservation.as_ref() == Some(&rule.reservation);
    match &rule.kind {
        RuleKind::EgRule(args) => {
            for &index in &args.indexes {
                let Some(info) = infos.get(index) else { continue };
                if info.state == MemoryInfoState::Raw && reserved(info) {
                    return Ok(Some(RuleFire::Eg { index }));
                }
            }
            Ok(None)
        }
        RuleKind::EpRule(args) => {
            // The lexicographically lower end drives purification; the remote
            // side's instance is created on demand by the pairing request.
            let mut by_remote: Vec<(&str, usize, f64)> = Vec::new();
            for info in infos {
                if !info.state.holds_pair() || !reserved(info) {
                    continue;
                }
                let Some(remote) = info.remote_node.as_deref() else { continue };
                if node_name >= remote {
                    continue;
                }
                let fid = effective_fidelity(sim, node_name, info, now);
                if fid < args.target_fidelity {
                    by_remote.push((remote, info.index, fid));
                }
            }
            let mut remotes: Vec<&str> = by_remote.iter().map(|(r, _, _)| *r).collect();
            remotes.sort_unstable();
            remotes.dedup();
            for remote in remotes {
                let mut group: Vec<(usize, f64)> = by_remote
                    .iter()
                    .filter(|(r, _, _)| *r == remote)
                    .map(|(_, i, f)| (*i, *f))
                    .collect();
                if group.len() < 2 {
                    continue;
                }
                group.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite fidelity").then(a.0.cmp(&b.0)));
                return Ok(Some(RuleFire::Ep {
                    kept: group[0].0,
                    meas: group[1].0,
                    remote: remote.to_string(),
                }));
            }
            Ok(None)
        }
        RuleKind::EsRuleA(args) => {
            let qualified = |side: &str| {
                infos.iter().find(|info| {
                    info.state.holds_pair()
                        && reserved(info)
                        && info.remote_node.as_deref() == Some(side)
                        && effective_fidelity(sim, node_name, info, now) >= args.target_fidelity
                })
            };
            match (qualified(&args.left), qualified(&args.right)) {
                (Some(left), Some(right)) => Ok(Some(RuleFire::EsA {
                    left_index: left.index,
                    right_index: right.index,
                })),
                _ => Ok(None),
            }
        }
        RuleKind::EsRuleB(args) => {
            for info in infos {
                if info.state.holds_pair()
                    && reserved(info)
                    && info
                        .remote_node
                        .as_deref()
                        .is_some_and(|remote| args.swappers.iter().any(|s| s == remote))
                    && effective_fidelity(sim, node_name, info, now) >= args.target_fidelity
                {
                    return Ok(Some(RuleFire::EsB { index: info.index }));
                }
            }
            Ok(None)
        }
    }
}

fn claim(sim: &mut Simulation, node_name: &str, index: usize) -> Result<MemoryInfoState> {
    let info = &mut sim.node_mut(node_name)?.resource_manager.memory_manager.infos[index];
    let previous = info.state;
    info.state = MemoryInfoState::Occupied;
    Ok(previous)
}

fn execute_action(sim: &mut Simulation, node_name: &str, rule: &Rule, fire: RuleFire) -> Result<()> {
    match (&rule.kind, fire) {
        (RuleKind::EgRule(args), RuleFire::Eg { index }) => {
            claim(sim, node_name, index)?;
            let id = sim.next_protocol_id();
            let (memory_name, memory_key) = {
                let node = sim.node(node_name)?;
                let memory = node
                    .memories
                    .as_ref()
                    .and_then(|array| array.get(index))
                    .ok_or_else(|| SimulationError::Precondition("missing memory".to_string()))?;
                (memory.name.clone(), memory.qsm_key)
            };
            let protocol = EntanglementGeneration {
                id,
                node: node_name.to_string(),
                rule: rule.id,
                reservation: rule.reservation.clone(),
                memory_index: index,
                memory_name,
                memory_key,
                mid: args.mid.clone(),
                remote_node: args.neighbor.clone(),
                remote_protocol: None,
                remote_memory_name: None,
                remote_memory_key: None,
                primary: args.primary,
                stage: GenStage::WaitingPair,
                round_results: [None, None],
                anchor: 0,
                qc_delay_self: 0,
                qc_delay_max: 0,
                period: 0,
                attempts: 0,
                pair_tag: id,
            };
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::Generation(protocol));
            debug!(node = node_name, protocol = id, mid = %args.mid, "eg_rule spawned generation");
            if args.primary {
                let matcher = ReqMatcher::Generation {
                    mid: args.mid.clone(),
                    peer: node_name.to_string(),
                    reservation: rule.reservation.clone(),
                };
                send_pairing_request(sim, node_name, &args.neighbor, id, matcher)?;
            } else {
                register_waiting(
                    sim,
                    node_name,
                    id,
                    WaitMatcher::Generation {
                        mid: args.mid.clone(),
                        peer: args.neighbor.clone(),
                        reservation: rule.reservation.clone(),
                    },
                )?;
            }
            Ok(())
        }
        (RuleKind::EpRule(args), RuleFire::Ep { kept, meas, remote }) => {
            let kept_prev = claim(sim, node_name, kept)?;
            let meas_prev = claim(sim, node_name, meas)?;
            let id = sim.next_protocol_id();
            let (kept_remote_memo, meas_remote_memo) = {
                let infos = &sim.node(node_name)?.resource_manager.memory_manager.infos;
                (
                    infos[kept].remote_memo.clone().unwrap_or_default(),
                    infos[meas].remote_memo.clone().unwrap_or_default(),
                )
            };
            let protocol = Bbpssw {
                id,
                node: node_name.to_string(),
                reservation: rule.reservation.clone(),
                kept_index: kept,
                meas_index: meas,
                kept_prev_state: kept_prev,
                meas_prev_state: meas_prev,
                remote_node: remote.clone(),
                remote_protocol: None,
                primary: true,
                local_bit: None,
                remote_bit: None,
                target_fidelity: args.target_fidelity,
            };
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::Purification(protocol));
            debug!(node = node_name, protocol = id, %remote, "ep_rule spawned purification");
            let matcher = ReqMatcher::Purification {
                kept_memo: kept_remote_memo,
                meas_memo: meas_remote_memo,
                reservation: rule.reservation.clone(),
                target_fidelity: args.target_fidelity,
            };
            send_pairing_request(sim, node_name, &remote, id, matcher)
        }
        (RuleKind::EsRuleA(_), RuleFire::EsA { left_index, right_index }) => {
            claim(sim, node_name, left_index)?;
            claim(sim, node_name, right_index)?;
            let id = sim.next_protocol_id();
            let (left_remote, right_remote) = {
                let infos = &sim.node(node_name)?.resource_manager.memory_manager.infos;
                (
                    (
                        infos[left_index].remote_node.clone().unwrap_or_default(),
                        infos[left_index].remote_memo.clone().unwrap_or_default(),
                    ),
                    (
                        infos[right_index].remote_node.clone().unwrap_or_default(),
                        infos[right_index].remote_memo.clone().unwrap_or_default(),
                    ),
                )
            };
            let protocol = SwappingA {
                id,
                node: node_name.to_string(),
                reservation: rule.reservation.clone(),
                left_index,
                right_index,
                left_remote_node: left_remote.0.clone(),
                left_remote_memo: left_remote.1.clone(),
                right_remote_node: right_remote.0.clone(),
                right_remote_memo: right_remote.1.clone(),
                left_protocol: None,
                right_protocol: None,
            };
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::SwapA(protocol));
            debug!(
                node = node_name,
                protocol = id,
                left = %left_remote.0,
                right = %right_remote.0,
                "es_rule_a spawned swapping"
            );
            send_pairing_request(
                sim,
                node_name,
                &left_remote.0.clone(),
                id,
                ReqMatcher::SwapB {
                    expected_memo: left_remote.1,
                },
            )?;
            send_pairing_request(
                sim,
                node_name,
                &right_remote.0.clone(),
                id,
                ReqMatcher::SwapB {
                    expected_memo: right_remote.1,
                },
            )
        }
        (RuleKind::EsRuleB(_), RuleFire::EsB { index }) => {
            claim(sim, node_name, index)?;
            let id = sim.next_protocol_id();
            let memo_name = {
                let node = sim.node(node_name)?;
                node.memories
                    .as_ref()
                    .and_then(|array| array.get(index))
                    .map(|m| m.name.clone())
                    .unwrap_or_default()
            };
            let protocol = SwappingB {
                id,
                node: node_name.to_string(),
                reservation: rule.reservation.clone(),
                memory_index: index,
                swapper_node: None,
                swapper_protocol: None,
            };
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::SwapB(protocol));
            debug!(node = node_name, protocol = id, memo = %memo_name, "es_rule_b parked swap endpoint");
            register_waiting(sim, node_name, id, WaitMatcher::SwapB { memo_name })
        }
        _ => Err(SimulationError::Protocol(
            "rule fire does not match rule kind".to_string(),
        )),
    }
}

fn send_pairing_request(
    sim: &mut Simulation,
    node_name: &str,
    remote: &str,
    protocol: ProtocolId,
    matcher: ReqMatcher,
) -> Result<()> {
    sim.send_message(
        node_name,
        remote,
        MessageKind::Pairing(PairingMsg::Request {
            from_node: node_name.to_string(),
            from_protocol: protocol,
            matcher,
        }),
    )
}

/// Park a passive protocol and drain any queued request that matches it.
fn register_waiting(
    sim: &mut Simulation,
    node_name: &str,
    protocol: ProtocolId,
    matcher: WaitMatcher,
) -> Result<()> {
    let pending = {
        let rm = &mut sim.node_mut(node_name)?.resource_manager;
        rm.waiting.push(WaitingEntry { protocol, matcher });
        let mut matched = None;
        for (slot, pending) in rm.pending_pairs.iter().enumerate() {
            if find_waiting(&rm.waiting, &pending.matcher).is_some() {
                matched = Some(slot);
                break;
            }
        }
        matched.map(|slot| rm.pending_pairs.remove(slot))
    };
    if let Some(pending) = pending {
        accept_request(sim, node_name, &pending.from_node, pending.from_protocol, pending.matcher)?;
    }
    Ok(())
}

fn find_waiting(waiting: &[WaitingEntry], matcher: &ReqMatcher) -> Option<usize> {
    waiting.iter().position(|entry| match (&entry.matcher, matcher) {
        (
            WaitMatcher::Generation {
                mid,
                peer,
                reservation,
            },
            ReqMatcher::Generation {
                mid: want_mid,
                peer: want_peer,
                reservation: want_res,
            },
        ) => mid == want_mid && peer == want_peer && reservation == want_res,
        (WaitMatcher::SwapB { memo_name }, ReqMatcher::SwapB { expected_memo }) => {
            memo_name == expected_memo
        }
        _ => false,
    })
}

/// Handle pairing traffic addressed to this node's resource manager.
pub fn handle_pairing(sim: &mut Simulation, node_name: &str, src: &str, msg: PairingMsg) -> Result<()> {
    match msg {
        PairingMsg::Request {
            from_node,
            from_protocol,
            matcher,
        } => {
            let matched = {
                let rm = &sim.node(node_name)?.resource_manager;
                find_waiting(&rm.waiting, &matcher).is_some()
                    || matches!(matcher, ReqMatcher::Purification { .. })
            };
            if matched {
                accept_request(sim, node_name, &from_node, from_protocol, matcher)
            } else {
                sim.node_mut(node_name)?
                    .resource_manager
                    .pending_pairs
                    .push(PendingPair {
                        from_node,
                        from_protocol,
                        matcher,
                    });
                Ok(())
            }
        }
        PairingMsg::Response {
            to_protocol,
            accepted,
            remote_protocol,
            remote_memory_name,
            remote_memory_key,
        } => crate::entanglement::handle_pair_response(
            sim,
            node_name,
            src,
            to_protocol,
            accepted,
            remote_protocol,
            remote_memory_name,
            remote_memory_key,
        ),
        PairingMsg::Abort { to_protocol } => {
            crate::entanglement::abort_protocol(sim, node_name, to_protocol, false)
        }
    }
}

fn accept_request(
    sim: &mut Simulation,
    node_name: &str,
    from_node: &str,
    from_protocol: ProtocolId,
    matcher: ReqMatcher,
) -> Result<()> {
    match matcher {
        ReqMatcher::Generation { .. } | ReqMatcher::SwapB { .. } => {
            let entry = {
                let rm = &mut sim.node_mut(node_name)?.resource_manager;
                match find_waiting(&rm.waiting, &matcher) {
                    Some(slot) => rm.waiting.remove(slot),
                    None => {
                        rm.pending_pairs.push(PendingPair {
                            from_node: from_node.to_string(),
                            from_protocol,
                            matcher,
                        });
                        return Ok(());
                    }
                }
            };
            let (memory_name, memory_key) =
                crate::entanglement::note_pairing(sim, node_name, entry.protocol, from_node, from_protocol)?;
            sim.send_message(
                node_name,
                from_node,
                MessageKind::Pairing(PairingMsg::Response {
                    to_protocol: from_protocol,
                    accepted: true,
                    remote_protocol: entry.protocol,
                    remote_memory_name: memory_name,
                    remote_memory_key: memory_key,
                }),
            )
        }
        ReqMatcher::Purification {
            kept_memo,
            meas_memo,
            reservation,
            target_fidelity,
        } => {
            let created = create_passive_purification(
                sim,
                node_name,
                from_node,
                from_protocol,
                &kept_memo,
                &meas_memo,
                &reservation,
                target_fidelity,
            )?;
            match created {
                Some((id, memory_name, memory_key)) => sim.send_message(
                    node_name,
                    from_node,
                    MessageKind::Pairing(PairingMsg::Response {
                        to_protocol: from_protocol,
                        accepted: true,
                        remote_protocol: id,
                        remote_memory_name: memory_name,
                        remote_memory_key: memory_key,
                    }),
                ),
                None => {
                    warn!(
                        node = node_name,
                        from = from_node,
                        "purification pairing refused: memories not in expected state"
                    );
                    sim.send_message(
                        node_name,
                        from_node,
                        MessageKind::Pairing(PairingMsg::Response {
                            to_protocol: from_protocol,
                            accepted: false,
                            remote_protocol: 0,
                            remote_memory_name: String::new(),
                            remote_memory_key: 0,
                        }),
                    )
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_passive_purification(
    sim: &mut Simulation,
    node_name: &str,
    from_node: &str,
    from_protocol: ProtocolId,
    kept_memo: &str,
    meas_memo: &str,
    reservation: &ReservationId,
    target_fidelity: f64,
) -> Result<Option<(ProtocolId, String, u64)>> {
    let located = {
        let node = sim.node(node_name)?;
        let index_of = |name: &str| {
            node.memories
                .as_ref()
                .and_then(|array| array.by_name(name))
                .map(|m| m.index)
        };
        match (index_of(kept_memo), index_of(meas_memo)) {
            (Some(kept), Some(meas)) => {
                let infos = &node.resource_manager.memory_manager.infos;
                let valid = |index: usize| {
                    infos[index].state.holds_pair()
                        && infos[index].remote_node.as_deref() == Some(from_node)
                        && infos[index].reservation.as_ref() == Some(reservation)
                };
                if valid(kept) && valid(meas) {
                    Some((kept, meas))
                } else {
                    None
                }
            }
            _ => None,
        }
    };
    let Some((kept, meas)) = located else {
        return Ok(None);
    };
    let kept_prev = claim(sim, node_name, kept)?;
    let meas_prev = claim(sim, node_name, meas)?;
    let id = sim.next_protocol_id();
    let protocol = Bbpssw {
        id,
        node: node_name.to_string(),
        reservation: reservation.clone(),
        kept_index: kept,
        meas_index: meas,
        kept_prev_state: kept_prev,
        meas_prev_state: meas_prev,
        remote_node: from_node.to_string(),
        remote_protocol: Some(from_protocol),
        primary: false,
        local_bit: None,
        remote_bit: None,
        target_fidelity,
    };
    sim.node_mut(node_name)?
        .protocols
        .insert(id, ProtocolInstance::Purification(protocol));
    Ok(Some((id, kept_memo.to_string(), 0)))
}

/// Remove all rules tagged with a reservation, terminating the protocols they
/// own, releasing their memory holdings, and clearing reservation stamps.
pub fn expire_rules_by_reservation(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &ReservationId,
) -> Result<()> {
    let owned: Vec<ProtocolId> = {
        let node = sim.node(node_name)?;
        node.protocols
            .iter()
            .filter(|(_, p)| p.reservation() == reservation)
            .map(|(id, _)| *id)
            .collect()
    };
    for id in owned {
        crate::entanglement::abort_protocol(sim, node_name, id, true)?;
    }
    {
        let node = sim.node_mut(node_name)?;
        let rm = &mut node.resource_manager;
        rm.rules.retain(|rule| &rule.reservation != reservation);
        rm.pending_pairs.retain(|p| !matcher_reservation_is(&p.matcher, reservation));
        for info in &mut rm.memory_manager.infos {
            if info.reservation.as_ref() == Some(reservation) {
                info.reservation = None;
            }
        }
    }
    debug!(node = node_name, ?reservation, "rules expired for reservation");
    Ok(())
}

fn matcher_reservation_is(matcher: &ReqMatcher, reservation: &ReservationId) -> bool {
    match matcher {
        ReqMatcher::Generation { reservation: r, .. } => r == reservation,
        ReqMatcher::Purification { reservation: r, .. } => r == reservation,
        ReqMatcher::SwapB { .. } => false,
    }
}

/// Drop a protocol's waiting-list registration, if any.
pub fn forget_waiting(sim: &mut Simulation, node_name: &str, protocol: ProtocolId) -> Result<()> {
    let rm = &mut sim.node_mut(node_name)?.resource_manager;
    rm.waiting.retain(|entry| entry.protocol != protocol);
    Ok(())
}

/// Stamp reserved memory slots with the reservation their rules belong to.
pub fn stamp_reservation(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &ReservationId,
    indexes: &[usize],
) -> Result<()> {
    let rm = &mut sim.node_mut(node_name)?.resource_manager;
    for &index in indexes {
        if let Some(info) = rm.memory_manager.infos.get_mut(index) {
            info.reservation = Some(reservation.clone());
        }
    }
    Ok(())
}
