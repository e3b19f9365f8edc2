//! # Entanglement Protocols
//!
//! The three protocol families driving memories and classical messages:
//!
//! - **Heralded generation** (meet-in-the-middle): two end nodes emit on a
//!   shared arrival grid toward a middle BSM node; two emission rounds with
//!   matching herald signs succeed, mismatched signs succeed with the
//!   phase-flipped Bell state, a missing herald fails the attempt.
//! - **BBPSSW distillation**: two co-entangled pairs between the same nodes;
//!   the sacrificial pair is measured, the bits exchanged, and the surviving
//!   pair kept iff the outcomes agree.
//! - **Swapping**: an A role at the middle consumes two memories entangled
//!   with different remotes, performs the Bell-state measurement, and ships
//!   Pauli corrections to the two B roles.
//!
//! Every instance is a tagged variant implementing the same small capability
//! set (start, received message, pairing, expiry); all cross-node interaction
//! goes through scheduled events and classical messages.

use rand::Rng;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::hardware::{Photon, RemoteMemory};
use crate::kernel::{precise_period_ps, Process, ProtocolId, SimTime};
use crate::messages::{GenerationMsg, HeraldSign, MessageKind, PairingMsg, PurificationMsg, SwappingMsg};
use crate::network_manager::ReservationId;
use crate::quantum_manager::{Circuit, Formalism, StateKey};
use crate::resource_manager::{self, MemoryInfoState, RuleId};
use crate::simulation::Simulation;
use crate::{Result, SimulationError};

/// Local preparation margin between negotiation and the first emission.
const PREP_MARGIN_PS: SimTime = 10_000;
/// Margin after the last herald can arrive before rounds are resolved.
const RESOLVE_MARGIN_PS: SimTime = 1_000;

/// Generation state machine position on an end node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenStage {
    WaitingPair,
    Negotiating,
    Wait1,
    Wait2,
}

/// Heralded-generation end-node role (the middle node stays passive, its BSM
/// unit heralds coincidences).
#[derive(Debug)]
pub struct EntanglementGeneration {
    pub id: ProtocolId,
    pub node: String,
    pub rule: RuleId,
    pub reservation: ReservationId,
    pub memory_index: usize,
    pub memory_name: String,
    pub memory_key: StateKey,
    pub mid: String,
    pub remote_node: String,
    pub remote_protocol: Option<ProtocolId>,
    pub remote_memory_name: Option<String>,
    pub remote_memory_key: Option<StateKey>,
    /// The primary side opens negotiation and writes the joint state
    pub primary: bool,
    pub stage: GenStage,
    pub round_results: [Option<HeraldSign>; 2],
    /// First-round arrival time at the middle node
    pub anchor: SimTime,
    pub qc_delay_self: SimTime,
    pub qc_delay_max: SimTime,
    pub period: SimTime,
    pub attempts: u32,
    /// Shared attempt tag: the primary protocol's id on both ends
    pub pair_tag: u64,
}

/// BBPSSW distillation role; the lexicographically lower end drives.
#[derive(Debug)]
pub struct Bbpssw {
    pub id: ProtocolId,
    pub node: String,
    pub reservation: ReservationId,
    pub kept_index: usize,
    pub meas_index: usize,
    pub kept_prev_state: MemoryInfoState,
    pub meas_prev_state: MemoryInfoState,
    pub remote_node: String,
    pub remote_protocol: Option<ProtocolId>,
    pub primary: bool,
    pub local_bit: Option<u8>,
    pub remote_bit: Option<u8>,
    pub target_fidelity: f64,
}

/// Swapping A role at an intermediate node.
#[derive(Debug)]
pub struct SwappingA {
    pub id: ProtocolId,
    pub node: String,
    pub reservation: ReservationId,
    pub left_index: usize,
    pub right_index: usize,
    pub left_remote_node: String,
    pub left_remote_memo: String,
    pub right_remote_node: String,
    pub right_remote_memo: String,
    pub left_protocol: Option<ProtocolId>,
    pub right_protocol: Option<ProtocolId>,
}

/// Swapping B role at a remote end of the swap.
#[derive(Debug)]
pub struct SwappingB {
    pub id: ProtocolId,
    pub node: String,
    pub reservation: ReservationId,
    pub memory_index: usize,
    pub swapper_node: Option<String>,
    pub swapper_protocol: Option<ProtocolId>,
}

/// The tagged protocol set a node can host.
#[derive(Debug)]
pub enum ProtocolInstance {
    Generation(EntanglementGeneration),
    Purification(Bbpssw),
    SwapA(SwappingA),
    SwapB(SwappingB),
}

impl ProtocolInstance {
    pub fn reservation(&self) -> &ReservationId {
        match self {
            ProtocolInstance::Generation(p) => &p.reservation,
            ProtocolInstance::Purification(p) => &p.reservation,
            ProtocolInstance::SwapA(p) => &p.reservation,
            ProtocolInstance::SwapB(p) => &p.reservation,
        }
    }

    /// Held memory slots with the state to restore on release.
    pub fn holdings(&self) -> SmallVec<[(usize, MemoryInfoState); 2]> {
        match self {
            ProtocolInstance::Generation(p) => {
                SmallVec::from_slice(&[(p.memory_index, MemoryInfoState::Raw)])
            }
            ProtocolInstance::Purification(p) => SmallVec::from_slice(&[
                (p.kept_index, p.kept_prev_state),
                (p.meas_index, p.meas_prev_state),
            ]),
            ProtocolInstance::SwapA(p) => SmallVec::from_slice(&[
                (p.left_index, MemoryInfoState::Entangled),
                (p.right_index, MemoryInfoState::Entangled),
            ]),
            ProtocolInstance::SwapB(p) => {
                SmallVec::from_slice(&[(p.memory_index, MemoryInfoState::Entangled)])
            }
        }
    }

    /// Paired remote protocols to notify on abort.
    pub fn peers(&self) -> SmallVec<[(String, ProtocolId); 2]> {
        let mut peers = SmallVec::new();
        match self {
            ProtocolInstance::Generation(p) => {
                if let Some(remote) = p.remote_protocol {
                    peers.push((p.remote_node.clone(), remote));
                }
            }
            ProtocolInstance::Purification(p) => {
                if let Some(remote) = p.remote_protocol {
                    peers.push((p.remote_node.clone(), remote));
                }
            }
            ProtocolInstance::SwapA(p) => {
                if let Some(left) = p.left_protocol {
                    peers.push((p.left_remote_node.clone(), left));
                }
                if let Some(right) = p.right_protocol {
                    peers.push((p.right_remote_node.clone(), right));
                }
            }
            ProtocolInstance::SwapB(p) => {
                if let (Some(node), Some(id)) = (&p.swapper_node, p.swapper_protocol) {
                    peers.push((node.clone(), id));
                }
            }
        }
        peers
    }
}

// ---------------------------------------------------------------------------
// Purification and swapping arithmetic
// ---------------------------------------------------------------------------

/// BBPSSW success probability and output fidelity for two Werner states.
pub fn werner_purification(f1: f64, f2: f64) -> (f64, f64) {
    let r1 = (1.0 - f1) / 3.0;
    let r2 = (1.0 - f2) / 3.0;
    let success = f1 * f2 + f1 * r2 + r1 * f2 + 5.0 * r1 * r2;
    let fidelity = (f1 * f2 + r1 * r2) / success;
    (success, fidelity)
}

/// DEJMPS-style distillation on Bell-diagonal tuples ordered
/// `[Phi+, Psi+, Phi-, Psi-]`. Success keeps even bit-flip parity.
pub fn dejmps_purification(p: [f64; 4], q: [f64; 4]) -> (f64, [f64; 4]) {
    let success = (p[0] + p[2]) * (q[0] + q[2]) + (p[1] + p[3]) * (q[1] + q[3]);
    if success <= 0.0 {
        return (0.0, [0.25; 4]);
    }
    let out = [
        (p[0] * q[0] + p[2] * q[2]) / success,
        (p[1] * q[1] + p[3] * q[3]) / success,
        (p[0] * q[2] + p[2] * q[0]) / success,
        (p[1] * q[3] + p[3] * q[1]) / success,
    ];
    (success, out)
}

/// Bell-group composition of two swapped pairs, mixed toward identity by the
/// degradation factor.
pub fn compose_swapped_bds(p: [f64; 4], q: [f64; 4], degradation: f64) -> [f64; 4] {
    // Bell index as (x, z) bits: Phi+=(0,0), Psi+=(1,0), Phi-=(0,1), Psi-=(1,1)
    let xz = |i: usize| ((i == 1 || i == 3) as usize, (i == 2 || i == 3) as usize);
    let index = |x: usize, z: usize| match (x, z) {
        (0, 0) => 0,
        (1, 0) => 1,
        (0, 1) => 2,
        _ => 3,
    };
    let mut out = [0.0f64; 4];
    for i in 0..4 {
        for j in 0..4 {
            let (xi, zi) = xz(i);
            let (xj, zj) = xz(j);
            out[index(xi ^ xj, zi ^ zj)] += p[i] * q[j];
        }
    }
    for value in &mut out {
        *value = degradation * *value + (1.0 - degradation) * 0.25;
    }
    out
}

fn bds_tuple(fidelity: f64, dominant: usize) -> [f64; 4] {
    let rest = (1.0 - fidelity) / 3.0;
    let mut tuple = [rest; 4];
    tuple[dominant] = fidelity;
    tuple
}

// ---------------------------------------------------------------------------
// Pairing plumbing
// ---------------------------------------------------------------------------

/// Complete a waiting protocol's pairing and report its memory identity.
pub fn note_pairing(
    sim: &mut Simulation,
    node_name: &str,
    protocol: ProtocolId,
    from_node: &str,
    from_protocol: ProtocolId,
) -> Result<(String, StateKey)> {
    let node = sim.node_mut(node_name)?;
    match node.protocols.get_mut(&protocol) {
        Some(ProtocolInstance::Generation(gen)) => {
            gen.remote_protocol = Some(from_protocol);
            gen.pair_tag = from_protocol;
            Ok((gen.memory_name.clone(), gen.memory_key))
        }
        Some(ProtocolInstance::SwapB(swap)) => {
            swap.swapper_node = Some(from_node.to_string());
            swap.swapper_protocol = Some(from_protocol);
            let (name, key) = node
                .memories
                .as_ref()
                .and_then(|array| array.get(swap.memory_index))
                .map(|m| (m.name.clone(), m.qsm_key))
                .unwrap_or_default();
            Ok((name, key))
        }
        Some(_) => Err(SimulationError::Protocol(format!(
            "protocol {protocol} cannot be paired by request"
        ))),
        None => Err(SimulationError::Protocol(format!(
            "unpaired protocol {protocol} vanished before pairing"
        ))),
    }
}

/// Handle a pairing response delivered to the requesting side.
#[allow(clippy::too_many_arguments)]
pub fn handle_pair_response(
    sim: &mut Simulation,
    node_name: &str,
    src: &str,
    to_protocol: ProtocolId,
    accepted: bool,
    remote_protocol: ProtocolId,
    remote_memory_name: String,
    remote_memory_key: StateKey,
) -> Result<()> {
    if !accepted {
        return abort_protocol(sim, node_name, to_protocol, false);
    }
    let start_now = {
        let node = sim.node_mut(node_name)?;
        match node.protocols.get_mut(&to_protocol) {
            Some(ProtocolInstance::Generation(gen)) => {
                gen.remote_protocol = Some(remote_protocol);
                gen.remote_memory_name = Some(remote_memory_name);
                gen.remote_memory_key = Some(remote_memory_key);
                true
            }
            Some(ProtocolInstance::SwapA(swap)) => {
                if src == swap.left_remote_node {
                    swap.left_protocol = Some(remote_protocol);
                } else if src == swap.right_remote_node {
                    swap.right_protocol = Some(remote_protocol);
                }
                swap.left_protocol.is_some() && swap.right_protocol.is_some()
            }
            Some(ProtocolInstance::Purification(ep)) => {
                ep.remote_protocol = Some(remote_protocol);
                true
            }
            _ => false,
        }
    };
    if start_now {
        let now = sim.timeline.now();
        sim.timeline.schedule(
            now,
            crate::kernel::DEFAULT_PRIORITY,
            Process::StartProtocol {
                node: node_name.to_string(),
                protocol: to_protocol,
            },
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Start / abort
// ---------------------------------------------------------------------------

/// Dispatch target of `Process::StartProtocol`.
pub fn start_protocol(sim: &mut Simulation, node_name: &str, id: ProtocolId) -> Result<()> {
    let Some(instance) = sim.node_mut(node_name)?.protocols.remove(&id) else {
        return Ok(());
    };
    match instance {
        ProtocolInstance::Generation(gen) => start_generation(sim, gen),
        ProtocolInstance::Purification(ep) => start_purification(sim, ep),
        ProtocolInstance::SwapA(swap) => perform_swap(sim, swap),
        ProtocolInstance::SwapB(swap) => {
            // B roles stay passive until the swap result arrives
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::SwapB(swap));
            Ok(())
        }
    }
}

/// Tear a protocol down, restoring its memory holdings and optionally
/// notifying its paired peers.
pub fn abort_protocol(
    sim: &mut Simulation,
    node_name: &str,
    id: ProtocolId,
    notify_peers: bool,
) -> Result<()> {
    abort_protocol_internal(sim, node_name, id, notify_peers, None)
}

fn abort_protocol_internal(
    sim: &mut Simulation,
    node_name: &str,
    id: ProtocolId,
    notify_peers: bool,
    skip_index: Option<usize>,
) -> Result<()> {
    let Some(instance) = sim.node_mut(node_name)?.protocols.remove(&id) else {
        return Ok(());
    };
    resource_manager::forget_waiting(sim, node_name, id)?;
    if notify_peers {
        for (peer_node, peer_protocol) in instance.peers() {
            sim.send_message(
                node_name,
                &peer_node,
                MessageKind::Pairing(PairingMsg::Abort {
                    to_protocol: peer_protocol,
                }),
            )?;
        }
    }
    for (index, previous) in instance.holdings() {
        if Some(index) == skip_index {
            continue;
        }
        release_holding(sim, node_name, index, previous)?;
    }
    debug!(node = node_name, protocol = id, "protocol aborted");
    Ok(())
}

/// Return a held memory to its pre-claim state: back to the entangled state
/// it was claimed from when the pair is still live, otherwise to RAW.
fn release_holding(
    sim: &mut Simulation,
    node_name: &str,
    index: usize,
    previous: MemoryInfoState,
) -> Result<()> {
    let (still_entangled, expired_event) = {
        let node = sim.node_mut(node_name)?;
        let memory = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(index))
            .ok_or_else(|| SimulationError::Precondition(format!("missing memory {index}")))?;
        if previous.holds_pair() && memory.entangled_memory.is_some() {
            (true, None)
        } else {
            let event = memory.expire_event.take();
            memory.release();
            (false, event)
        }
    };
    if let Some(event) = expired_event {
        sim.timeline.remove_event(event);
    }
    let state = if still_entangled { previous } else { MemoryInfoState::Raw };
    resource_manager::update(sim, node_name, index, state)
}

// ---------------------------------------------------------------------------
// Heralded generation
// ---------------------------------------------------------------------------

fn start_generation(sim: &mut Simulation, mut gen: EntanglementGeneration) -> Result<()> {
    if !gen.primary {
        // Secondary ends are driven by the incoming NEGOTIATE
        let node_name = gen.node.clone();
        let id = gen.id;
        sim.node_mut(&node_name)?
            .protocols
            .insert(id, ProtocolInstance::Generation(gen));
        return Ok(());
    }
    let remote_protocol = gen.remote_protocol.ok_or_else(|| {
        SimulationError::Protocol("generation started before pairing".to_string())
    })?;
    gen.qc_delay_self = sim.qchannel_delay(&gen.node, &gen.mid)?;
    let frequency = {
        let node = sim.node(&gen.node)?;
        node.memories
            .as_ref()
            .and_then(|array| array.get(gen.memory_index))
            .map(|m| m.frequency)
            .unwrap_or(2e3)
    };
    gen.stage = GenStage::Negotiating;
    gen.round_results = [None, None];
    let msg = GenerationMsg::Negotiate {
        to_protocol: remote_protocol,
        from_protocol: gen.id,
        qc_delay: gen.qc_delay_self,
        frequency,
        memory_name: gen.memory_name.clone(),
        memory_key: gen.memory_key,
    };
    let node_name = gen.node.clone();
    let remote = gen.remote_node.clone();
    let id = gen.id;
    sim.node_mut(&node_name)?
        .protocols
        .insert(id, ProtocolInstance::Generation(gen));
    sim.send_message(&node_name, &remote, MessageKind::Generation(msg))
}

/// Schedule both emission rounds and the resolution point for one attempt.
fn schedule_attempt(sim: &mut Simulation, gen: &EntanglementGeneration) -> Result<()> {
    let base = u8::try_from((gen.attempts * 2) % 250).unwrap_or(0);
    for round in 0..2u8 {
        let arrival = gen.anchor + SimTime::from(round) * gen.period;
        let emit_time = arrival - gen.qc_delay_self;
        sim.timeline.schedule(
            emit_time,
            0,
            Process::EmitRound {
                node: gen.node.clone(),
                protocol: gen.id,
                round: base + round,
            },
        )?;
    }
    let herald_delay = sim.cchannel_delay(&gen.mid, &gen.node)?;
    let resolve_time = gen.anchor + gen.period + herald_delay + RESOLVE_MARGIN_PS;
    sim.timeline.schedule(
        resolve_time,
        crate::kernel::DEFAULT_PRIORITY,
        Process::ResolveRounds {
            node: gen.node.clone(),
            protocol: gen.id,
        },
    )?;
    Ok(())
}

/// Handle generation traffic addressed to a protocol on this node.
pub fn handle_generation_msg(
    sim: &mut Simulation,
    node_name: &str,
    src: &str,
    msg: GenerationMsg,
) -> Result<()> {
    match msg {
        GenerationMsg::Negotiate {
            to_protocol,
            from_protocol,
            qc_delay,
            frequency,
            memory_name,
            memory_key,
        } => {
            let Some(ProtocolInstance::Generation(mut gen)) =
                sim.node_mut(node_name)?.protocols.remove(&to_protocol)
            else {
                return Ok(());
            };
            gen.remote_protocol = Some(from_protocol);
            gen.remote_memory_name = Some(memory_name);
            gen.remote_memory_key = Some(memory_key);
            gen.qc_delay_self = sim.qchannel_delay(node_name, &gen.mid)?;
            gen.qc_delay_max = gen.qc_delay_self.max(qc_delay);
            let own_frequency = {
                let node = sim.node(node_name)?;
                node.memories
                    .as_ref()
                    .and_then(|array| array.get(gen.memory_index))
                    .map(|m| m.frequency)
                    .unwrap_or(2e3)
            };
            gen.period = precise_period_ps(own_frequency).max(precise_period_ps(frequency));
            let ack_delay = sim.cchannel_delay(node_name, src)?;
            gen.anchor = sim.timeline.now() + ack_delay + gen.qc_delay_max + PREP_MARGIN_PS;
            gen.stage = GenStage::Wait1;
            gen.round_results = [None, None];
            schedule_attempt(sim, &gen)?;
            let ack = GenerationMsg::NegotiateAck {
                to_protocol: from_protocol,
                anchor: gen.anchor,
                period: gen.period,
                qc_delay: gen.qc_delay_self,
                memory_name: gen.memory_name.clone(),
                memory_key: gen.memory_key,
            };
            let id = gen.id;
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::Generation(gen));
            sim.send_message(node_name, src, MessageKind::Generation(ack))
        }
        GenerationMsg::NegotiateAck {
            to_protocol,
            anchor,
            period,
            qc_delay,
            memory_name,
            memory_key,
        } => {
            let Some(ProtocolInstance::Generation(mut gen)) =
                sim.node_mut(node_name)?.protocols.remove(&to_protocol)
            else {
                return Ok(());
            };
            gen.remote_memory_name = Some(memory_name);
            gen.remote_memory_key = Some(memory_key);
            gen.anchor = anchor;
            gen.period = period;
            gen.qc_delay_max = gen.qc_delay_self.max(qc_delay);
            gen.stage = GenStage::Wait1;
            gen.round_results = [None, None];
            schedule_attempt(sim, &gen)?;
            let id = gen.id;
            sim.node_mut(node_name)?
                .protocols
                .insert(id, ProtocolInstance::Generation(gen));
            Ok(())
        }
        GenerationMsg::MeasRes {
            to_protocol,
            round,
            sign,
        } => {
            let node = sim.node_mut(node_name)?;
            if let Some(ProtocolInstance::Generation(gen)) = node.protocols.get_mut(&to_protocol) {
                let base = u8::try_from((gen.attempts * 2) % 250).unwrap_or(0);
                if round >= base && round < base + 2 {
                    let slot = usize::from(round - base);
                    gen.round_results[slot] = Some(sign);
                    gen.stage = if slot == 0 { GenStage::Wait2 } else { gen.stage };
                }
            }
            Ok(())
        }
    }
}

/// Dispatch target of `Process::EmitRound`: one photon toward the middle.
pub fn emit_round(sim: &mut Simulation, node_name: &str, id: ProtocolId, round: u8) -> Result<()> {
    let (photon, mid, prepare_index) = {
        let node = sim.node_mut(node_name)?;
        let Some(ProtocolInstance::Generation(gen)) = node.protocols.get_mut(&id) else {
            return Ok(());
        };
        let base = u8::try_from((gen.attempts * 2) % 250).unwrap_or(0);
        if round < base || round >= base + 2 {
            return Ok(()); // stale emission from a superseded attempt
        }
        let pair_tag = gen.pair_tag;
        let mid = gen.mid.clone();
        let prepare_index = (round == base).then_some(gen.memory_index);
        let photon = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(gen.memory_index))
            .and_then(|memory| memory.excite(node_name, pair_tag, id, round));
        (photon, mid, prepare_index)
    };
    if let Some(index) = prepare_index {
        // The emitting memory starts the attempt in the |+> state
        if sim.qsm.formalism() != Formalism::BellDiagonal {
            let h = num_complex::Complex64::new(std::f64::consts::FRAC_1_SQRT_2, 0.0);
            sim.update_memory_state(node_name, index, &[h, h])?;
        }
    }
    if let Some(photon) = photon {
        sim.transmit_photon(node_name, &mid, photon)?;
    }
    Ok(())
}

/// Dispatch target of `Process::DeliverPhoton` at the middle node.
pub fn bsm_photon(sim: &mut Simulation, node_name: &str, photon: Photon) -> Result<()> {
    let (outcome, observers) = {
        let node = sim.node_mut(node_name)?;
        let Some(bsm) = node.bsm.as_mut() else {
            warn!(node = node_name, "photon delivered to a node without a BSM unit");
            return Ok(());
        };
        bsm.prune_pair_below(photon.pair_tag, photon.round);
        let outcome = bsm.receive(&photon);
        let observers = bsm.observers.clone();
        (outcome, observers)
    };
    let Some(outcome) = outcome else {
        return Ok(());
    };
    let now = sim.timeline.now();
    {
        let node = sim.node_mut(node_name)?;
        for observer in observers {
            node.trigger_log.push((observer, now));
        }
    }
    debug!(
        node = node_name,
        round = outcome.round,
        sign = ?outcome.sign,
        "coincidence heralded"
    );
    // Herald reports are counter-pinned so simultaneous deliveries at the two
    // ends resolve in submission order even for an equidistant middle node.
    for (end_node, protocol) in outcome.ends.clone() {
        sim.send_message_counter_pinned(
            node_name,
            &end_node,
            MessageKind::Generation(GenerationMsg::MeasRes {
                to_protocol: protocol,
                round: outcome.round,
                sign: outcome.sign,
            }),
        )?;
    }
    Ok(())
}

/// Dispatch target of `Process::ResolveRounds`: tally both herald reports.
pub fn resolve_rounds(sim: &mut Simulation, node_name: &str, id: ProtocolId) -> Result<()> {
    let Some(ProtocolInstance::Generation(mut gen)) =
        sim.node_mut(node_name)?.protocols.remove(&id)
    else {
        return Ok(());
    };
    match (gen.round_results[0], gen.round_results[1]) {
        (Some(first), Some(second)) => {
            let same_sign = first == second;
            generation_succeed(sim, gen, same_sign)
        }
        _ => {
            gen.attempts += 1;
            let max_attempts = sim.config.hardware.generation_attempts;
            if gen.attempts >= max_attempts {
                info!(
                    node = node_name,
                    protocol = id,
                    attempts = gen.attempts,
                    "generation failed after retry budget"
                );
                let index = gen.memory_index;
                release_holding(sim, node_name, index, MemoryInfoState::Raw)
            } else {
                gen.round_results = [None, None];
                gen.stage = GenStage::Negotiating;
                let retry_at = if gen.primary {
                    let rtt = 2 * sim.cchannel_delay(&gen.node, &gen.remote_node)?;
                    Some(sim.timeline.now() + rtt)
                } else {
                    None
                };
                let id = gen.id;
                let node = gen.node.clone();
                sim.node_mut(&node)?
                    .protocols
                    .insert(id, ProtocolInstance::Generation(gen));
                if let Some(at) = retry_at {
                    sim.timeline.schedule(
                        at,
                        crate::kernel::DEFAULT_PRIORITY,
                        Process::StartProtocol {
                            node,
                            protocol: id,
                        },
                    )?;
                }
                Ok(())
            }
        }
    }
}

fn generation_succeed(
    sim: &mut Simulation,
    gen: EntanglementGeneration,
    same_sign: bool,
) -> Result<()> {
    let entangle_time = gen.anchor + gen.period;
    let remote_memory = RemoteMemory {
        node: gen.remote_node.clone(),
        memory: gen.remote_memory_name.clone().unwrap_or_default(),
    };
    let (raw_fidelity, expire_at) = {
        let node = sim.node_mut(&gen.node)?;
        let memory = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(gen.memory_index))
            .ok_or_else(|| SimulationError::Precondition("missing memory".to_string()))?;
        let raw = memory.raw_fidelity;
        memory.set_entangled(remote_memory, raw, entangle_time);
        (raw, memory.cutoff_time(entangle_time))
    };
    let expire_at = expire_at.max(sim.timeline.now());
    let expire_event = sim.timeline.schedule(
        expire_at,
        crate::kernel::DEFAULT_PRIORITY,
        Process::ExpireMemory {
            node: gen.node.clone(),
            index: gen.memory_index,
        },
    )?;
    {
        let node = sim.node_mut(&gen.node)?;
        if let Some(memory) = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(gen.memory_index))
        {
            memory.expire_event = Some(expire_event);
        }
    }
    if gen.primary {
        let remote_key = gen.remote_memory_key.ok_or_else(|| {
            SimulationError::Protocol("generation succeeded without remote key".to_string())
        })?;
        // Same-sign rounds herald Psi+; mismatched signs flip the phase
        let dominant = if same_sign { 1 } else { 3 };
        sim.qsm
            .set_bell_diagonal([gen.memory_key, remote_key], bds_tuple(raw_fidelity, dominant))?;
    }
    info!(
        node = %gen.node,
        memory = %gen.memory_name,
        remote = %gen.remote_node,
        fidelity = raw_fidelity,
        "entanglement generated"
    );
    resource_manager::update(sim, &gen.node, gen.memory_index, MemoryInfoState::Entangled)
}

// ---------------------------------------------------------------------------
// BBPSSW distillation
// ---------------------------------------------------------------------------

fn start_purification(sim: &mut Simulation, mut ep: Bbpssw) -> Result<()> {
    let remote_protocol = ep.remote_protocol.ok_or_else(|| {
        SimulationError::Protocol("purification started before pairing".to_string())
    })?;
    let node_name = ep.node.clone();
    let (kept_key, meas_key, kept_fid, meas_fid) = {
        let node = sim.node(&node_name)?;
        let array = node.memories.as_ref().ok_or_else(|| {
            SimulationError::Precondition("purification on a memory-less node".to_string())
        })?;
        let kept = array.get(ep.kept_index).ok_or_else(|| {
            SimulationError::Precondition("missing kept memory".to_string())
        })?;
        let meas = array.get(ep.meas_index).ok_or_else(|| {
            SimulationError::Precondition("missing sacrificial memory".to_string())
        })?;
        (kept.qsm_key, meas.qsm_key, kept.fidelity, meas.fidelity)
    };

    // One shared draw decides the round; the exchanged bits encode it. Pairs
    // whose shared state vanished mid-flight (remote expiry) always fail.
    let (success, new_tuple) = if sim.qsm.formalism() == Formalism::BellDiagonal {
        match (sim.qsm.bell_diagonal(kept_key), sim.qsm.bell_diagonal(meas_key)) {
            (Ok(p), Ok(q)) => {
                let (prob, tuple) = dejmps_purification(p, q);
                let roll: f64 = sim.node_mut(&node_name)?.rng.gen();
                (roll < prob, Some(tuple))
            }
            _ => (false, None),
        }
    } else {
        let (prob, _) = werner_purification(kept_fid, meas_fid);
        let roll: f64 = sim.node_mut(&node_name)?.rng.gen();
        (roll < prob, None)
    };
    let bit: u8 = u8::from(sim.node_mut(&node_name)?.rng.gen::<bool>());
    let remote_bit = if success { bit } else { 1 - bit };

    // Collapse both sacrificial qubits in the shared store; the remote side
    // reads its outcome from there when the bit exchange arrives
    let partner_key = sim
        .qsm
        .get(meas_key)
        .ok()
        .and_then(|view| view.keys.into_iter().find(|k| *k != meas_key));
    let zero = num_complex::Complex64::new(0.0, 0.0);
    let one = num_complex::Complex64::new(1.0, 0.0);
    let collapse = |bit: u8| if bit == 0 { [one, zero] } else { [zero, one] };
    sim.qsm.set(&[meas_key], &collapse(bit))?;
    if let Some(partner) = partner_key {
        sim.qsm.set(&[partner], &collapse(remote_bit))?;
    }
    if success {
        if let Some(tuple) = new_tuple {
            if let Ok(partner) = kept_partner(sim, kept_key) {
                sim.qsm.set_bell_diagonal([kept_key, partner], tuple)?;
            }
        }
    }

    ep.local_bit = Some(bit);
    let msg = PurificationMsg::MeasResult {
        to_protocol: remote_protocol,
        bit,
    };
    let id = ep.id;
    let remote = ep.remote_node.clone();
    sim.node_mut(&node_name)?
        .protocols
        .insert(id, ProtocolInstance::Purification(ep));
    sim.send_message(&node_name, &remote, MessageKind::Purification(msg))
}

fn kept_partner(sim: &Simulation, kept_key: StateKey) -> Result<StateKey> {
    sim.qsm
        .get(kept_key)?
        .keys
        .into_iter()
        .find(|k| *k != kept_key)
        .ok_or_else(|| SimulationError::Protocol("kept pair has no partner key".to_string()))
}

/// Handle the measurement-bit exchange of a purification round.
pub fn handle_purification_msg(
    sim: &mut Simulation,
    node_name: &str,
    _src: &str,
    msg: PurificationMsg,
) -> Result<()> {
    let PurificationMsg::MeasResult { to_protocol, bit } = msg;
    let Some(ProtocolInstance::Purification(mut ep)) =
        sim.node_mut(node_name)?.protocols.remove(&to_protocol)
    else {
        return Ok(());
    };
    ep.remote_bit = Some(bit);
    if ep.local_bit.is_none() {
        // Passive side: read the collapsed sacrificial qubit and reply
        let meas_key = {
            let node = sim.node(node_name)?;
            node.memories
                .as_ref()
                .and_then(|array| array.get(ep.meas_index))
                .map(|m| m.qsm_key)
                .ok_or_else(|| {
                    SimulationError::Precondition("missing sacrificial memory".to_string())
                })?
        };
        // An unreadable outcome (state lost to a racing expiry) forces the
        // mismatch path so both sides discard
        let local = sim.qsm.read_bit(meas_key).unwrap_or(bit ^ 1);
        ep.local_bit = Some(local);
        let reply = PurificationMsg::MeasResult {
            to_protocol: ep.remote_protocol.ok_or_else(|| {
                SimulationError::Protocol("purification reply without pairing".to_string())
            })?,
            bit: local,
        };
        let remote = ep.remote_node.clone();
        sim.send_message(node_name, &remote, MessageKind::Purification(reply))?;
    }
    conclude_purification(sim, ep)
}

fn conclude_purification(sim: &mut Simulation, ep: Bbpssw) -> Result<()> {
    let (Some(local), Some(remote)) = (ep.local_bit, ep.remote_bit) else {
        let id = ep.id;
        let node = ep.node.clone();
        sim.node_mut(&node)?
            .protocols
            .insert(id, ProtocolInstance::Purification(ep));
        return Ok(());
    };
    let success = local == remote;
    let node_name = ep.node.clone();

    // Fidelity inputs are read before the sacrificial slot is released
    let new_fidelity = {
        let node = sim.node(&node_name)?;
        let array = node.memories.as_ref().ok_or_else(|| {
            SimulationError::Precondition("purification on a memory-less node".to_string())
        })?;
        let kept = array.get(ep.kept_index).ok_or_else(|| {
            SimulationError::Precondition("missing kept memory".to_string())
        })?;
        if sim.qsm.formalism() == Formalism::BellDiagonal {
            match sim.qsm.bell_diagonal(kept.qsm_key) {
                Ok(tuple) => tuple.iter().fold(0.0f64, |a, &b| a.max(b)),
                Err(_) => kept.fidelity,
            }
        } else {
            let meas_fid = array
                .get(ep.meas_index)
                .map(|m| m.fidelity)
                .unwrap_or(kept.fidelity);
            werner_purification(kept.fidelity, meas_fid).1
        }
    };

    // The sacrificial pair is consumed either way
    release_measured(sim, &node_name, ep.meas_index)?;

    if success {
        {
            let node = sim.node_mut(&node_name)?;
            if let Some(memory) = node
                .memories
                .as_mut()
                .and_then(|array| array.get_mut(ep.kept_index))
            {
                memory.fidelity = new_fidelity;
            }
        }
        info!(
            node = %node_name,
            kept = ep.kept_index,
            fidelity = new_fidelity,
            "purification succeeded"
        );
        resource_manager::update(sim, &node_name, ep.kept_index, MemoryInfoState::Purified)
    } else {
        info!(node = %node_name, kept = ep.kept_index, "purification failed, pairs discarded");
        release_measured(sim, &node_name, ep.kept_index)
    }
}

fn release_measured(sim: &mut Simulation, node_name: &str, index: usize) -> Result<()> {
    let expired_event = {
        let node = sim.node_mut(node_name)?;
        if let Some(memory) = node.memories.as_mut().and_then(|array| array.get_mut(index)) {
            let event = memory.expire_event.take();
            memory.release();
            event
        } else {
            None
        }
    };
    if let Some(event) = expired_event {
        sim.timeline.remove_event(event);
    }
    resource_manager::update(sim, node_name, index, MemoryInfoState::Raw)
}

// ---------------------------------------------------------------------------
// Swapping
// ---------------------------------------------------------------------------

fn perform_swap(sim: &mut Simulation, swap: SwappingA) -> Result<()> {
    let node_name = swap.node.clone();
    let now = sim.timeline.now();
    let config = sim.config.hardware.clone();
    let (left_key, right_key, f_left, f_right) = {
        let node = sim.node(&node_name)?;
        let array = node.memories.as_ref().ok_or_else(|| {
            SimulationError::Precondition("swapping on a memory-less node".to_string())
        })?;
        let left = array.get(swap.left_index).ok_or_else(|| {
            SimulationError::Precondition("missing left memory".to_string())
        })?;
        let right = array.get(swap.right_index).ok_or_else(|| {
            SimulationError::Precondition("missing right memory".to_string())
        })?;
        (
            left.qsm_key,
            right.qsm_key,
            left.effective_fidelity(now),
            right.effective_fidelity(now),
        )
    };
    let rolled: f64 = sim.node_mut(&node_name)?.rng.gen();
    let new_fidelity = f_left * f_right * config.swap_degradation;

    // A pair whose remote half expired mid-flight has lost its shared state;
    // the swap then degrades to a failure instead of aborting the run
    let partners = (partner_of(sim, left_key), partner_of(sim, right_key));
    let (success, left_partner, right_partner) = match partners {
        (Ok(left), Ok(right)) => (rolled < config.swap_success_prob, left, right),
        _ => (false, 0, 0),
    };

    let (correct_z, correct_x) = if sim.qsm.formalism() == Formalism::BellDiagonal {
        if success {
            let p = sim.qsm.bell_diagonal(left_key)?;
            let q = sim.qsm.bell_diagonal(right_key)?;
            let composed = compose_swapped_bds(p, q, config.swap_degradation);
            sim.qsm.set_bell_diagonal([left_partner, right_partner], composed)?;
        }
        let z: bool = sim.node_mut(&node_name)?.rng.gen();
        let x: bool = sim.node_mut(&node_name)?.rng.gen();
        (z, x)
    } else if success {
        // Local Bell-state measurement through the shared store
        let mut circuit = Circuit::new(2);
        circuit.cx(0, 1)?;
        circuit.h(0)?;
        circuit.measure(0)?;
        circuit.measure(1)?;
        let sample: f64 = sim.node_mut(&node_name)?.rng.gen();
        let outcome = sim.qsm.run_circuit(&circuit, &[left_key, right_key], sample)?;
        (
            outcome.get(&left_key).copied().unwrap_or(0) == 1,
            outcome.get(&right_key).copied().unwrap_or(0) == 1,
        )
    } else {
        (false, false)
    };

    let left_msg = SwappingMsg::Result {
        to_protocol: swap.left_protocol.ok_or_else(|| {
            SimulationError::Protocol("swap fired before left pairing".to_string())
        })?,
        success,
        correct_x: false,
        correct_z,
        new_remote_node: swap.right_remote_node.clone(),
        new_remote_memo: swap.right_remote_memo.clone(),
        new_remote_key: right_partner,
        fidelity: new_fidelity,
        swap_time: now,
    };
    let right_msg = SwappingMsg::Result {
        to_protocol: swap.right_protocol.ok_or_else(|| {
            SimulationError::Protocol("swap fired before right pairing".to_string())
        })?,
        success,
        correct_x,
        correct_z: false,
        new_remote_node: swap.left_remote_node.clone(),
        new_remote_memo: swap.left_remote_memo.clone(),
        new_remote_key: left_partner,
        fidelity: new_fidelity,
        swap_time: now,
    };
    sim.send_message(&node_name, &swap.left_remote_node, MessageKind::Swapping(left_msg))?;
    sim.send_message(&node_name, &swap.right_remote_node, MessageKind::Swapping(right_msg))?;

    if success {
        info!(
            node = %node_name,
            left = %swap.left_remote_node,
            right = %swap.right_remote_node,
            fidelity = new_fidelity,
            "entanglement swapped"
        );
    } else {
        info!(node = %node_name, "swap failed, holdings discarded");
    }

    // The intermediate memories are consumed either way
    for index in [swap.left_index, swap.right_index] {
        release_measured(sim, &node_name, index)?;
    }
    Ok(())
}

fn partner_of(sim: &Simulation, key: StateKey) -> Result<StateKey> {
    sim.qsm
        .get(key)?
        .keys
        .into_iter()
        .find(|k| *k != key)
        .ok_or_else(|| SimulationError::Protocol("swap input has no partner key".to_string()))
}

/// Handle a swap result at a B role.
pub fn handle_swapping_msg(
    sim: &mut Simulation,
    node_name: &str,
    _src: &str,
    msg: SwappingMsg,
) -> Result<()> {
    let SwappingMsg::Result {
        to_protocol,
        success,
        correct_x,
        correct_z,
        new_remote_node,
        new_remote_memo,
        new_remote_key: _,
        fidelity,
        swap_time,
    } = msg;
    let Some(ProtocolInstance::SwapB(swap)) =
        sim.node_mut(node_name)?.protocols.remove(&to_protocol)
    else {
        return Ok(());
    };
    if !success {
        return release_measured(sim, node_name, swap.memory_index);
    }

    let memory_key = {
        let node = sim.node(node_name)?;
        node.memories
            .as_ref()
            .and_then(|array| array.get(swap.memory_index))
            .map(|m| m.qsm_key)
            .ok_or_else(|| SimulationError::Precondition("missing swap memory".to_string()))?
    };
    // A vanished shared state (remote expiry in flight) voids the swap
    if sim.qsm.get(memory_key).is_err() {
        return release_measured(sim, node_name, swap.memory_index);
    }
    if sim.qsm.formalism() != Formalism::BellDiagonal && (correct_x || correct_z) {
        let mut circuit = Circuit::new(1);
        if correct_x {
            circuit.x(0)?;
        }
        if correct_z {
            circuit.z(0)?;
        }
        sim.qsm.run_circuit(&circuit, &[memory_key], 0.0)?;
    }

    let (expire_at, expired_event) = {
        let node = sim.node_mut(node_name)?;
        let memory = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(swap.memory_index))
            .ok_or_else(|| SimulationError::Precondition("missing swap memory".to_string()))?;
        let event = memory.expire_event.take();
        memory.set_entangled(
            RemoteMemory {
                node: new_remote_node.clone(),
                memory: new_remote_memo,
            },
            fidelity,
            swap_time,
        );
        (memory.cutoff_time(swap_time), event)
    };
    if let Some(event) = expired_event {
        sim.timeline.remove_event(event);
    }
    let expire_at = expire_at.max(sim.timeline.now());
    let expire_event = sim.timeline.schedule(
        expire_at,
        crate::kernel::DEFAULT_PRIORITY,
        Process::ExpireMemory {
            node: node_name.to_string(),
            index: swap.memory_index,
        },
    )?;
    {
        let node = sim.node_mut(node_name)?;
        if let Some(memory) = node
            .memories
            .as_mut()
            .and_then(|array| array.get_mut(swap.memory_index))
        {
            memory.expire_event = Some(expire_event);
        }
    }
    debug!(
        node = node_name,
        memory = swap.memory_index,
        remote = %new_remote_node,
        fidelity,
        "swap correction applied"
    );
    resource_manager::update(sim, node_name, swap.memory_index, MemoryInfoState::Entangled)
}

// ---------------------------------------------------------------------------
// Memory expiry
// ---------------------------------------------------------------------------

/// Dispatch target of `Process::ExpireMemory`: coherence cutoff reached.
pub fn expire_memory(sim: &mut Simulation, node_name: &str, index: usize) -> Result<()> {
    let (key, observers) = {
        let node = sim.node_mut(node_name)?;
        let Some(memory) = node.memories.as_mut().and_then(|array| array.get_mut(index)) else {
            return Ok(());
        };
        // The entangled-memory pointer is nulled before any observer runs
        memory.release();
        memory.expire_event = None;
        (memory.qsm_key, memory.observers.clone())
    };
    // Decoherence map: the local qubit collapses out of the shared pair
    let one = num_complex::Complex64::new(1.0, 0.0);
    let zero = num_complex::Complex64::new(0.0, 0.0);
    sim.qsm.set(&[key], &[one, zero])?;

    let now = sim.timeline.now();
    {
        let node = sim.node_mut(node_name)?;
        for observer in observers {
            node.trigger_log.push((observer, now));
        }
    }

    // Protocols holding this memory are dropped before they can fire
    let holders: Vec<ProtocolId> = {
        let node = sim.node(node_name)?;
        node.protocols
            .iter()
            .filter(|(_, p)| p.holdings().iter().any(|(i, _)| *i == index))
            .map(|(id, _)| *id)
            .collect()
    };
    for holder in holders {
        abort_protocol_internal(sim, node_name, holder, true, Some(index))?;
    }
    info!(node = node_name, memory = index, "memory expired to RAW");
    resource_manager::update(sim, node_name, index, MemoryInfoState::Raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_werner_purification_known_values() {
        let (p, f) = werner_purification(0.85, 0.85);
        assert!((p - 0.82).abs() < 1e-12);
        assert!((f - 0.725 / 0.82).abs() < 1e-12);
        // Perfect inputs purify perfectly with certainty
        let (p, f) = werner_purification(1.0, 1.0);
        assert!((p - 1.0).abs() < 1e-12);
        assert!((f - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_purification_raises_fidelity_above_half() {
        for f_in in [0.6, 0.7, 0.85, 0.95] {
            let (_, f_out) = werner_purification(f_in, f_in);
            assert!(f_out > f_in, "{f_in} should improve, got {f_out}");
        }
    }

    #[test]
    fn test_dejmps_matches_werner_on_werner_inputs() {
        let w = |f: f64| {
            let r = (1.0 - f) / 3.0;
            [f, r, r, r]
        };
        let (p, tuple) = dejmps_purification(w(0.85), w(0.85));
        let (p_ref, f_ref) = werner_purification(0.85, 0.85);
        assert!((p - p_ref).abs() < 1e-12);
        assert!((tuple[0] - f_ref).abs() < 1e-12);
    }

    #[test]
    fn test_bds_swap_composition_is_normalized() {
        let p = [0.85, 0.05, 0.05, 0.05];
        let q = [0.9, 0.04, 0.03, 0.03];
        let out = compose_swapped_bds(p, q, 0.99);
        let total: f64 = out.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(out[0] > 0.7, "dominant component survives: {out:?}");
    }

    #[test]
    fn test_perfect_swap_composition_is_exact() {
        let perfect = [1.0, 0.0, 0.0, 0.0];
        let out = compose_swapped_bds(perfect, perfect, 1.0);
        assert_eq!(out, perfect);
    }
}
