//! # QKD Stack
//!
//! BB84 bit-sifting key agreement with cascade error correction layered
//! above, both driven by the same kernel. The two protocols expose the same
//! two-function interface to their upper layer: `push(keysize, num_keys)`
//! requests keys, `pop` delivers them (here: into the node's key pool).
//!
//! BB84 emits batched pulse trains; the quantum channel rolls per-pulse loss
//! and polarization flips. Cascade runs seeded deterministic passes of block
//! parities with interactive binary search, then a hash-bisection
//! confirmation stage that deterministically locates any residual differing
//! bits, so corrected keys always match.

use std::collections::HashMap;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand::SeedableRng;
use sha3::{Digest, Sha3_256};
use tracing::{debug, info};

use crate::hardware::{PulseTrain, QkdPulse};
use crate::kernel::{precise_period_ps, Process, SimTime};
use crate::messages::{Bb84Msg, CascadeMsg, MessageKind};
use crate::simulation::Simulation;
use crate::{Result, SimulationError};

/// Corrected keys delivered to the node, newest last.
#[derive(Debug, Default)]
pub struct KeyPool {
    pub keys: Vec<Vec<u8>>,
}

impl KeyPool {
    pub fn push(&mut self, key: Vec<u8>) {
        self.keys.push(key);
    }

    /// Take the oldest delivered key, upper-layer `pop` style.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        if self.keys.is_empty() {
            None
        } else {
            Some(self.keys.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Protocol role; the lexicographically lower QKD node is Alice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkdRole {
    Alice,
    Bob,
}

/// BB84 endpoint state.
#[derive(Debug)]
pub struct Bb84 {
    pub node: String,
    pub peer: String,
    pub role: QkdRole,
    pub keysize: usize,
    pub remaining_keys: u32,
    pub batch_size: usize,
    next_batch: u32,
    /// Alice: encoded pulses per outstanding batch
    sent: HashMap<u32, Vec<QkdPulse>>,
    /// Bob: measured (index, basis, bit) per outstanding batch
    measured: HashMap<u32, Vec<(u32, bool, bool)>>,
    sifted: Vec<bool>,
}

impl Bb84 {
    pub fn new(node: String, peer: String, batch_size: usize) -> Self {
        let role = if node < peer { QkdRole::Alice } else { QkdRole::Bob };
        Self {
            node,
            peer,
            role,
            keysize: 0,
            remaining_keys: 0,
            batch_size,
            next_batch: 0,
            sent: HashMap::new(),
            measured: HashMap::new(),
            sifted: Vec::new(),
        }
    }
}

/// Cascade endpoint state. Sessions are numbered by sifted-key delivery
/// order, identical on both sides because the classical channel is in-order.
#[derive(Debug)]
pub struct Cascade {
    pub node: String,
    pub peer: String,
    pub role: QkdRole,
    pub passes: u32,
    pub block_size: usize,
    next_session: u32,
    sessions: HashMap<u32, CascadeSession>,
}

#[derive(Debug)]
struct CascadeSession {
    key: Vec<bool>,
    seed: u64,
    pass: u32,
    /// Bob: permuted-position intervals under binary search
    active: Vec<(u32, u32)>,
    /// Bob: raw-index intervals under hash bisection
    confirm: Vec<(u32, u32)>,
}

impl Cascade {
    pub fn new(node: String, peer: String, passes: u32, block_size: usize) -> Self {
        let role = if node < peer { QkdRole::Alice } else { QkdRole::Bob };
        Self {
            node,
            peer,
            role,
            passes,
            block_size: block_size.max(2),
            next_session: 0,
            sessions: HashMap::new(),
        }
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (7 - i % 8);
        }
    }
    out
}

fn hash_bits(bits: &[bool]) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(pack_bits(bits));
    hasher.finalize().to_vec()
}

/// Deterministic per-pass permutation shared by both ends.
fn permutation(seed: u64, pass: u32, len: usize) -> Vec<u32> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed ^ (u64::from(pass).wrapping_mul(0x9E37_79B9_7F4A_7C15)));
    let mut perm: Vec<u32> = (0..len as u32).collect();
    for i in (1..perm.len()).rev() {
        let j = rng.gen_range(0..=i);
        perm.swap(i, j);
    }
    perm
}

fn block_size_for(base: usize, pass: u32, len: usize) -> usize {
    (base << pass.min(16)).min(len.max(2))
}

// ---------------------------------------------------------------------------
// BB84
// ---------------------------------------------------------------------------

/// Upper-layer `push`: request `num_keys` keys of `keysize` bits.
///
/// Must be called on the Alice side (the lexicographically lower node); Alice
/// drives the pulse batches and Bob follows.
pub fn push(sim: &mut Simulation, node_name: &str, keysize: usize, num_keys: u32) -> Result<()> {
    let peer = {
        let node = sim.node_mut(node_name)?;
        let bb84 = node.bb84.as_mut().ok_or_else(|| {
            SimulationError::Precondition(format!("{node_name} has no BB84 stack"))
        })?;
        if bb84.role != QkdRole::Alice {
            return Err(SimulationError::Precondition(
                "push must be issued on the Alice side".to_string(),
            ));
        }
        bb84.keysize = keysize;
        bb84.remaining_keys = num_keys;
        bb84.peer.clone()
    };
    sim.send_message(
        node_name,
        &peer,
        MessageKind::Bb84(Bb84Msg::Push {
            keysize: keysize as u32,
            num_keys,
        }),
    )?;
    let now = sim.timeline.now();
    let batch = sim
        .node(node_name)?
        .bb84
        .as_ref()
        .map(|b| b.next_batch)
        .unwrap_or(0);
    sim.timeline.schedule(
        now,
        crate::kernel::DEFAULT_PRIORITY,
        Process::EmitPulseTrain {
            node: node_name.to_string(),
            batch,
        },
    )?;
    info!(node = node_name, keysize, num_keys, "qkd push accepted");
    Ok(())
}

/// Dispatch target of `Process::EmitPulseTrain`: Alice encodes one batch.
pub fn emit_pulse_train(sim: &mut Simulation, node_name: &str, batch: u32) -> Result<()> {
    let (train, peer) = {
        let node = sim.node_mut(node_name)?;
        let Some(bb84) = node.bb84.as_mut() else {
            return Ok(());
        };
        if bb84.remaining_keys == 0 || batch != bb84.next_batch {
            return Ok(());
        }
        bb84.next_batch += 1;
        let mut pulses = Vec::with_capacity(bb84.batch_size);
        for index in 0..bb84.batch_size {
            pulses.push(QkdPulse {
                index: index as u32,
                basis: node.rng.gen(),
                bit: node.rng.gen(),
            });
        }
        bb84.sent.insert(batch, pulses.clone());
        (
            PulseTrain {
                src_node: node_name.to_string(),
                batch,
                pulses,
            },
            bb84.peer.clone(),
        )
    };
    debug!(node = node_name, batch, pulses = train.pulses.len(), "pulse train emitted");
    sim.transmit_train(node_name, &peer, train)
}

/// Dispatch target of `Process::DeliverPulseTrain`: Bob measures a batch.
pub fn receive_pulse_train(
    sim: &mut Simulation,
    node_name: &str,
    src: &str,
    train: PulseTrain,
) -> Result<()> {
    let (batch, indexes, bases) = {
        let node = sim.node_mut(node_name)?;
        let detector_efficiency = node.detector.as_ref().map(|d| d.efficiency).unwrap_or(1.0);
        let Some(bb84) = node.bb84.as_mut() else {
            return Ok(());
        };
        let mut results = Vec::with_capacity(train.pulses.len());
        for pulse in &train.pulses {
            if detector_efficiency < 1.0 && node.rng.gen::<f64>() >= detector_efficiency {
                continue;
            }
            let basis: bool = node.rng.gen();
            let bit = if basis == pulse.basis {
                // The channel already applied polarization flips to the bit
                pulse.bit
            } else {
                node.rng.gen()
            };
            results.push((pulse.index, basis, bit));
        }
        let indexes: Vec<u32> = results.iter().map(|(i, _, _)| *i).collect();
        let bases: Vec<bool> = results.iter().map(|(_, b, _)| *b).collect();
        bb84.measured.insert(train.batch, results);
        (train.batch, indexes, bases)
    };
    sim.send_message(
        node_name,
        src,
        MessageKind::Bb84(Bb84Msg::BasisList {
            batch,
            indexes,
            bases,
        }),
    )
}

/// Handle BB84 sifting traffic.
pub fn handle_bb84(sim: &mut Simulation, node_name: &str, src: &str, msg: Bb84Msg) -> Result<()> {
    match msg {
        Bb84Msg::Push { keysize, num_keys } => {
            let node = sim.node_mut(node_name)?;
            if let Some(bb84) = node.bb84.as_mut() {
                bb84.keysize = keysize as usize;
                bb84.remaining_keys = num_keys;
            }
            Ok(())
        }
        Bb84Msg::BasisList {
            batch,
            indexes,
            bases,
        } => {
            // Alice sifts against her record and answers with the keepers
            let (matched, emit_next) = {
                let node = sim.node_mut(node_name)?;
                let Some(bb84) = node.bb84.as_mut() else {
                    return Ok(());
                };
                let Some(sent) = bb84.sent.remove(&batch) else {
                    return Ok(());
                };
                let mut matched = Vec::new();
                for (&index, &basis) in indexes.iter().zip(bases.iter()) {
                    let pulse = &sent[index as usize];
                    if pulse.basis == basis {
                        matched.push(index);
                        bb84.sifted.push(pulse.bit);
                    }
                }
                (matched, bb84.remaining_keys > 0)
            };
            sim.send_message(
                node_name,
                src,
                MessageKind::Bb84(Bb84Msg::MatchedIndexes {
                    batch,
                    indexes: matched,
                }),
            )?;
            extract_keys(sim, node_name)?;
            if emit_next {
                let still_needed = sim
                    .node(node_name)?
                    .bb84
                    .as_ref()
                    .is_some_and(|b| b.remaining_keys > 0);
                if still_needed {
                    let (next_batch, period) = {
                        let node = sim.node(node_name)?;
                        let bb84 = node.bb84.as_ref().expect("checked above");
                        let frequency = node
                            .light_source
                            .as_ref()
                            .map(|ls| ls.frequency_hz)
                            .unwrap_or(8e7);
                        (
                            bb84.next_batch,
                            precise_period_ps(frequency) * bb84.batch_size as SimTime,
                        )
                    };
                    let at = sim.timeline.now() + period;
                    sim.timeline.schedule(
                        at,
                        crate::kernel::DEFAULT_PRIORITY,
                        Process::EmitPulseTrain {
                            node: node_name.to_string(),
                            batch: next_batch,
                        },
                    )?;
                }
            }
            Ok(())
        }
        Bb84Msg::MatchedIndexes { batch, indexes } => {
            {
                let node = sim.node_mut(node_name)?;
                let Some(bb84) = node.bb84.as_mut() else {
                    return Ok(());
                };
                let Some(measured) = bb84.measured.remove(&batch) else {
                    return Ok(());
                };
                let by_index: HashMap<u32, bool> =
                    measured.into_iter().map(|(i, _, bit)| (i, bit)).collect();
                for index in indexes {
                    if let Some(&bit) = by_index.get(&index) {
                        bb84.sifted.push(bit);
                    }
                }
            }
            extract_keys(sim, node_name)
        }
    }
}

/// Move completed keysize-chunks of sifted bits up the stack.
fn extract_keys(sim: &mut Simulation, node_name: &str) -> Result<()> {
    loop {
        let chunk = {
            let node = sim.node_mut(node_name)?;
            let Some(bb84) = node.bb84.as_mut() else {
                return Ok(());
            };
            if bb84.keysize == 0
                || bb84.remaining_keys == 0
                || bb84.sifted.len() < bb84.keysize
            {
                None
            } else {
                let rest = bb84.sifted.split_off(bb84.keysize);
                let chunk = std::mem::replace(&mut bb84.sifted, rest);
                bb84.remaining_keys -= 1;
                Some(chunk)
            }
        };
        match chunk {
            Some(bits) => deliver_sifted(sim, node_name, bits)?,
            None => return Ok(()),
        }
    }
}

/// Hand one sifted key to the layer above BB84.
fn deliver_sifted(sim: &mut Simulation, node_name: &str, bits: Vec<bool>) -> Result<()> {
    let has_cascade = sim.node(node_name)?.cascade.is_some();
    if has_cascade {
        cascade_on_sifted(sim, node_name, bits)
    } else {
        let key = pack_bits(&bits);
        info!(node = node_name, bits = bits.len(), "sifted key delivered");
        sim.node_mut(node_name)?.key_pool.push(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

fn cascade_on_sifted(sim: &mut Simulation, node_name: &str, bits: Vec<bool>) -> Result<()> {
    let (session, role, peer, seed, len) = {
        let node = sim.node_mut(node_name)?;
        let cascade = node.cascade.as_mut().ok_or_else(|| {
            SimulationError::Precondition("cascade stack missing".to_string())
        })?;
        let session = cascade.next_session;
        cascade.next_session += 1;
        let seed = match cascade.role {
            QkdRole::Alice => node.rng.gen::<u64>(),
            QkdRole::Bob => 0,
        };
        let len = bits.len();
        cascade.sessions.insert(
            session,
            CascadeSession {
                key: bits,
                seed,
                pass: 0,
                active: Vec::new(),
                confirm: Vec::new(),
            },
        );
        (session, cascade.role, cascade.peer.clone(), seed, len)
    };
    if role == QkdRole::Alice {
        sim.send_message(
            node_name,
            &peer,
            MessageKind::Cascade(CascadeMsg::Start {
                session,
                seed,
                key_len: len as u32,
            }),
        )?;
        send_parities(sim, node_name, session, 0)?;
    }
    Ok(())
}

/// Alice's block parities for one pass.
fn send_parities(sim: &mut Simulation, node_name: &str, session: u32, pass: u32) -> Result<()> {
    let (parities, peer) = {
        let node = sim.node(node_name)?;
        let cascade = node.cascade.as_ref().expect("cascade stack present");
        let state = cascade
            .sessions
            .get(&session)
            .ok_or_else(|| SimulationError::Protocol("unknown cascade session".to_string()))?;
        let perm = permutation(state.seed, pass, state.key.len());
        let block = block_size_for(cascade.block_size, pass, state.key.len());
        let mut parities = Vec::new();
        for chunk in perm.chunks(block) {
            let parity = chunk.iter().fold(false, |acc, &p| acc ^ state.key[p as usize]);
            parities.push(parity);
        }
        (parities, cascade.peer.clone())
    };
    sim.send_message(
        node_name,
        &peer,
        MessageKind::Cascade(CascadeMsg::Parities {
            session,
            pass,
            parities,
        }),
    )
}

fn interval_parity(key: &[bool], perm: &[u32], interval: (u32, u32)) -> bool {
    (interval.0..interval.1).fold(false, |acc, p| acc ^ key[perm[p as usize] as usize])
}

/// Handle cascade traffic addressed to this node.
pub fn handle_cascade(sim: &mut Simulation, node_name: &str, src: &str, msg: CascadeMsg) -> Result<()> {
    match msg {
        CascadeMsg::Start { session, seed, key_len } => {
            let node = sim.node_mut(node_name)?;
            let Some(cascade) = node.cascade.as_mut() else {
                return Ok(());
            };
            let Some(state) = cascade.sessions.get_mut(&session) else {
                return Err(SimulationError::Protocol(
                    "cascade start before sifted key delivery".to_string(),
                ));
            };
            if state.key.len() != key_len as usize {
                return Err(SimulationError::Protocol(
                    "cascade key length mismatch".to_string(),
                ));
            }
            state.seed = seed;
            Ok(())
        }
        CascadeMsg::Parities {
            session,
            pass,
            parities,
        } => {
            // Bob compares block parities and opens binary searches
            let queries = {
                let node = sim.node_mut(node_name)?;
                let Some(cascade) = node.cascade.as_mut() else {
                    return Ok(());
                };
                let block_base = cascade.block_size;
                let Some(state) = cascade.sessions.get_mut(&session) else {
                    return Ok(());
                };
                state.pass = pass;
                state.active.clear();
                let len = state.key.len();
                let perm = permutation(state.seed, pass, len);
                let block = block_size_for(block_base, pass, len);
                for (i, &alice_parity) in parities.iter().enumerate() {
                    let lo = (i * block) as u32;
                    let hi = (((i + 1) * block).min(len)) as u32;
                    if lo >= hi {
                        continue;
                    }
                    if interval_parity(&state.key, &perm, (lo, hi)) != alice_parity {
                        state.active.push((lo, hi));
                    }
                }
                bisection_step(state, &perm)
            };
            advance_pass(sim, node_name, src, session, pass, queries)
        }
        CascadeMsg::ParityQuery {
            session,
            pass,
            intervals,
        } => {
            // Alice answers sub-block parities
            let parities = {
                let node = sim.node(node_name)?;
                let Some(cascade) = node.cascade.as_ref() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get(&session) else {
                    return Ok(());
                };
                let perm = permutation(state.seed, pass, state.key.len());
                intervals
                    .iter()
                    .map(|&interval| interval_parity(&state.key, &perm, interval))
                    .collect::<Vec<bool>>()
            };
            sim.send_message(
                node_name,
                src,
                MessageKind::Cascade(CascadeMsg::ParityReply {
                    session,
                    pass,
                    parities,
                }),
            )
        }
        CascadeMsg::ParityReply {
            session,
            pass,
            parities,
        } => {
            // Bob narrows each active interval by one level
            let queries = {
                let node = sim.node_mut(node_name)?;
                let Some(cascade) = node.cascade.as_mut() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get_mut(&session) else {
                    return Ok(());
                };
                let perm = permutation(state.seed, pass, state.key.len());
                let active = std::mem::take(&mut state.active);
                for (interval, alice_left) in active.into_iter().zip(parities.into_iter()) {
                    let (lo, hi) = interval;
                    let mid = (lo + hi) / 2;
                    let bob_left = interval_parity(&state.key, &perm, (lo, mid));
                    let narrowed = if bob_left != alice_left { (lo, mid) } else { (mid, hi) };
                    state.active.push(narrowed);
                }
                bisection_step(state, &perm)
            };
            advance_pass(sim, node_name, src, session, pass, queries)
        }
        CascadeMsg::PassDone { session, pass } => {
            // Alice advances to the next pass or opens confirmation
            let (more_passes, hash) = {
                let node = sim.node(node_name)?;
                let Some(cascade) = node.cascade.as_ref() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get(&session) else {
                    return Ok(());
                };
                (pass + 1 < cascade.passes, hash_bits(&state.key))
            };
            if more_passes {
                send_parities(sim, node_name, session, pass + 1)
            } else {
                sim.send_message(
                    node_name,
                    src,
                    MessageKind::Cascade(CascadeMsg::KeyHash { session, hash }),
                )
            }
        }
        CascadeMsg::KeyHash { session, hash } => {
            // Bob verifies; mismatches open the hash-bisection stage
            let matches = {
                let node = sim.node(node_name)?;
                let Some(cascade) = node.cascade.as_ref() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get(&session) else {
                    return Ok(());
                };
                hash_bits(&state.key) == hash
            };
            if matches {
                finish_session(sim, node_name, session)?;
                return sim.send_message(
                    node_name,
                    src,
                    MessageKind::Cascade(CascadeMsg::Done { session }),
                );
            }
            let intervals = {
                let node = sim.node_mut(node_name)?;
                let cascade = node.cascade.as_mut().expect("checked above");
                let state = cascade.sessions.get_mut(&session).expect("checked above");
                let len = state.key.len() as u32;
                let mid = len / 2;
                state.confirm = vec![(0, mid), (mid, len)];
                state.confirm.clone()
            };
            sim.send_message(
                node_name,
                src,
                MessageKind::Cascade(CascadeMsg::HashQuery { session, intervals }),
            )
        }
        CascadeMsg::HashQuery { session, intervals } => {
            // Alice answers interval digests
            let hashes = {
                let node = sim.node(node_name)?;
                let Some(cascade) = node.cascade.as_ref() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get(&session) else {
                    return Ok(());
                };
                intervals
                    .iter()
                    .map(|&(lo, hi)| hash_bits(&state.key[lo as usize..hi as usize]))
                    .collect::<Vec<Vec<u8>>>()
            };
            sim.send_message(
                node_name,
                src,
                MessageKind::Cascade(CascadeMsg::HashReply { session, hashes }),
            )
        }
        CascadeMsg::HashReply { session, hashes } => {
            // Bob splits differing intervals until every wrong bit is flipped
            let next = {
                let node = sim.node_mut(node_name)?;
                let Some(cascade) = node.cascade.as_mut() else {
                    return Ok(());
                };
                let Some(state) = cascade.sessions.get_mut(&session) else {
                    return Ok(());
                };
                let pending = std::mem::take(&mut state.confirm);
                let mut next = Vec::new();
                for ((lo, hi), alice_hash) in pending.into_iter().zip(hashes.into_iter()) {
                    if hash_bits(&state.key[lo as usize..hi as usize]) == alice_hash {
                        continue;
                    }
                    if hi - lo == 1 {
                        let index = lo as usize;
                        state.key[index] = !state.key[index];
                        continue;
                    }
                    let mid = (lo + hi) / 2;
                    next.push((lo, mid));
                    next.push((mid, hi));
                }
                state.confirm = next.clone();
                next
            };
            if next.is_empty() {
                finish_session(sim, node_name, session)?;
                sim.send_message(
                    node_name,
                    src,
                    MessageKind::Cascade(CascadeMsg::Done { session }),
                )
            } else {
                sim.send_message(
                    node_name,
                    src,
                    MessageKind::Cascade(CascadeMsg::HashQuery {
                        session,
                        intervals: next,
                    }),
                )
            }
        }
        CascadeMsg::Done { session } => finish_session(sim, node_name, session),
    }
}

/// After a bisection level, either continue querying or report the pass done.
fn advance_pass(
    sim: &mut Simulation,
    node_name: &str,
    src: &str,
    session: u32,
    pass: u32,
    queries: Vec<(u32, u32)>,
) -> Result<()> {
    if queries.is_empty() {
        sim.send_message(
            node_name,
            src,
            MessageKind::Cascade(CascadeMsg::PassDone { session, pass }),
        )
    } else {
        sim.send_message(
            node_name,
            src,
            MessageKind::Cascade(CascadeMsg::ParityQuery {
                session,
                pass,
                intervals: queries,
            }),
        )
    }
}

/// Resolve single-bit intervals, then emit the left-half queries for the
/// intervals still open. Returns the queries for the next level.
fn bisection_step(state: &mut CascadeSession, perm: &[u32]) -> Vec<(u32, u32)> {
    let active = std::mem::take(&mut state.active);
    let mut queries = Vec::new();
    for (lo, hi) in active {
        if hi - lo == 1 {
            let raw = perm[lo as usize] as usize;
            state.key[raw] = !state.key[raw];
            continue;
        }
        let mid = (lo + hi) / 2;
        queries.push((lo, mid));
        state.active.push((lo, hi));
    }
    queries
}

/// Deliver a corrected key into the pool and drop the session.
fn finish_session(sim: &mut Simulation, node_name: &str, session: u32) -> Result<()> {
    let key = {
        let node = sim.node_mut(node_name)?;
        let Some(cascade) = node.cascade.as_mut() else {
            return Ok(());
        };
        cascade.sessions.remove(&session).map(|s| pack_bits(&s.key))
    };
    if let Some(key) = key {
        info!(node = node_name, session, "cascade key delivered");
        sim.node_mut(node_name)?.key_pool.push(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_bits_msb_first() {
        let bits = [true, false, true, false, false, false, false, true, true];
        assert_eq!(pack_bits(&bits), vec![0b1010_0001, 0b1000_0000]);
    }

    #[test]
    fn test_permutation_is_deterministic_and_complete() {
        let a = permutation(42, 1, 100);
        let b = permutation(42, 1, 100);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(sorted, expected);
        assert_ne!(permutation(42, 2, 100), a);
    }

    #[test]
    fn test_interval_parity() {
        let key = [true, true, false, true];
        let perm: Vec<u32> = (0..4).collect();
        assert!(!interval_parity(&key, &perm, (0, 2)));
        assert!(interval_parity(&key, &perm, (0, 4)));
        assert!(interval_parity(&key, &perm, (2, 4)));
    }

    #[test]
    fn test_block_size_doubles_per_pass() {
        assert_eq!(block_size_for(16, 0, 128), 16);
        assert_eq!(block_size_for(16, 1, 128), 32);
        assert_eq!(block_size_for(16, 4, 128), 128);
    }

    #[test]
    fn test_bisection_flips_single_bit_interval() {
        let mut state = CascadeSession {
            key: vec![false, false, false, false],
            seed: 0,
            pass: 0,
            active: vec![(2, 3)],
            confirm: Vec::new(),
        };
        let perm: Vec<u32> = (0..4).collect();
        let queries = bisection_step(&mut state, &perm);
        assert!(queries.is_empty());
        assert_eq!(state.key, vec![false, false, true, false]);
    }

    #[test]
    fn test_roles_follow_name_order() {
        let alice = Bb84::new("qa".to_string(), "qb".to_string(), 256);
        let bob = Bb84::new("qb".to_string(), "qa".to_string(), 256);
        assert_eq!(alice.role, QkdRole::Alice);
        assert_eq!(bob.role, QkdRole::Bob);
    }
}
