//! # Classical Message Model
//!
//! Typed payloads for every protocol family carried over classical channels.
//! A channel's `transmit` propagates the message priority unchanged, so
//! protocols that need ordered observation among cross-channel messages (the
//! generation protocol's herald reports) pin priorities explicitly.

use crate::kernel::{ProtocolId, SimTime, DEFAULT_PRIORITY};
use crate::network_manager::Reservation;
use crate::quantum_manager::StateKey;
use crate::resource_manager::ReqMatcher;

/// A classical message in flight: payload plus the propagated event priority.
#[derive(Debug, Clone)]
pub struct Message {
    pub priority: u64,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            kind,
        }
    }

    pub fn with_priority(kind: MessageKind, priority: u64) -> Self {
        Self { priority, kind }
    }
}

/// Every message family the control plane exchanges.
#[derive(Debug, Clone)]
pub enum MessageKind {
    Generation(GenerationMsg),
    Purification(PurificationMsg),
    Swapping(SwappingMsg),
    Pairing(PairingMsg),
    Reservation(ReservationMsg),
    Routing(RoutingMsg),
    Bb84(Bb84Msg),
    Cascade(CascadeMsg),
}

/// Herald outcome sign reported by the middle node for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeraldSign {
    PsiPlus,
    PsiMinus,
}

/// Heralded-generation coordination between the two end nodes and the middle.
#[derive(Debug, Clone)]
pub enum GenerationMsg {
    /// Primary end opens a round pair: its middle delay and memory identity
    Negotiate {
        to_protocol: ProtocolId,
        from_protocol: ProtocolId,
        qc_delay: SimTime,
        frequency: f64,
        memory_name: String,
        memory_key: StateKey,
    },
    /// Secondary end fixes the emission anchor on the shared arrival grid
    NegotiateAck {
        to_protocol: ProtocolId,
        anchor: SimTime,
        period: SimTime,
        qc_delay: SimTime,
        memory_name: String,
        memory_key: StateKey,
    },
    /// Middle-node herald report for one emission round
    MeasRes {
        to_protocol: ProtocolId,
        round: u8,
        sign: HeraldSign,
    },
}

/// BBPSSW measurement-bit exchange.
#[derive(Debug, Clone)]
pub enum PurificationMsg {
    MeasResult { to_protocol: ProtocolId, bit: u8 },
}

/// Swapping outcome pushed from the A role to both B roles.
#[derive(Debug, Clone)]
pub enum SwappingMsg {
    Result {
        to_protocol: ProtocolId,
        success: bool,
        correct_x: bool,
        correct_z: bool,
        new_remote_node: String,
        new_remote_memo: String,
        new_remote_key: StateKey,
        fidelity: f64,
        swap_time: SimTime,
    },
}

/// Resource-manager pairing traffic: matchers travel to the remote node and
/// are applied against its active protocols.
#[derive(Debug, Clone)]
pub enum PairingMsg {
    Request {
        from_node: String,
        from_protocol: ProtocolId,
        matcher: ReqMatcher,
    },
    Response {
        to_protocol: ProtocolId,
        accepted: bool,
        remote_protocol: ProtocolId,
        remote_memory_name: String,
        remote_memory_key: StateKey,
    },
    /// Terminal condition on one side tears the pair down on the other
    Abort { to_protocol: ProtocolId },
}

/// Hop-by-hop reservation protocol of the network manager.
#[derive(Debug, Clone)]
pub enum ReservationMsg {
    /// Travels initiator -> responder, accumulating traversed node names
    Request {
        reservation: Reservation,
        qcaps: Vec<String>,
    },
    /// Travels responder -> initiator along the established path
    Approve {
        reservation: Reservation,
        path: Vec<String>,
    },
    /// Unwinds prior hops on the traversed prefix
    Reject {
        reservation: Reservation,
        path: Vec<String>,
    },
}

/// Distance-vector routing advertisements (pluggable routing variant).
#[derive(Debug, Clone)]
pub enum RoutingMsg {
    DistanceVector {
        origin: String,
        distances: Vec<(String, u64)>,
    },
}

/// BB84 sifting exchange after each pulse batch.
#[derive(Debug, Clone)]
pub enum Bb84Msg {
    /// Alice -> Bob: key request parameters from the upper layer
    Push { keysize: u32, num_keys: u32 },
    /// Bob -> Alice: indexes of detected pulses and the bases used
    BasisList {
        batch: u32,
        indexes: Vec<u32>,
        bases: Vec<bool>,
    },
    /// Alice -> Bob: the detected indexes where bases matched
    MatchedIndexes { batch: u32, indexes: Vec<u32> },
}

/// Cascade error-correction exchange, layered above BB84.
#[derive(Debug, Clone)]
pub enum CascadeMsg {
    /// Alice opens a session over one sifted key
    Start {
        session: u32,
        seed: u64,
        key_len: u32,
    },
    /// Alice's block parities for one pass
    Parities {
        session: u32,
        pass: u32,
        parities: Vec<bool>,
    },
    /// Bob's binary-search queries, intervals over permuted positions
    ParityQuery {
        session: u32,
        pass: u32,
        intervals: Vec<(u32, u32)>,
    },
    ParityReply {
        session: u32,
        pass: u32,
        parities: Vec<bool>,
    },
    PassDone { session: u32, pass: u32 },
    /// Alice's whole-key digest opening the confirmation stage
    KeyHash { session: u32, hash: Vec<u8> },
    /// Bob's hash-bisection queries, intervals over raw key positions
    HashQuery {
        session: u32,
        intervals: Vec<(u32, u32)>,
    },
    HashReply {
        session: u32,
        hashes: Vec<Vec<u8>>,
    },
    Done { session: u32 },
}
