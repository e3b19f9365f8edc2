//! # Quantum State Manager
//!
//! Process-wide store of multi-qubit quantum states keyed by memory
//! identifiers. Supports compose-on-demand tensor products, gate application,
//! and projective measurement with cached operator evaluation.
//!
//! ## Formalisms
//!
//! Three representations register themselves in an internal factory table and
//! one is selected at startup, immutable thereafter:
//!
//! - **Ket vector**: complex amplitude vector over 2^n basis states
//! - **Density matrix**: 2^n x 2^n complex matrix (Fock / decoherence runs)
//! - **Bell-diagonal**: four real probabilities over `[Phi+, Psi+, Phi-, Psi-]`,
//!   valid only for bipartite co-held states; single qubits stay trivial kets
//!
//! ## State identity
//!
//! Every key maps to exactly one state; all keys of a joint state co-own that
//! state; `set`, `run_circuit`, and `remove` are the only operations that
//! change state identity.
//!
//! ## Caching
//!
//! Gate application and measurement distributions over ket states are memoized
//! in two LRU caches keyed by (state bits, qubit indices). Capacity is fixed
//! at startup. The simulator is single-threaded, so plain lock-guarded LRUs
//! satisfy the contract.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use ndarray::Array2;
use num_complex::Complex64;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::{Result, SimulationError};

/// Identifier of one qubit slot in the shared store.
pub type StateKey = u64;

const FRAC_1_SQRT_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// The registered gate set. Anything outside this table is `UnknownGate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    H,
    X,
    Y,
    Z,
    S,
    T,
    Cnot,
    Swap,
}

impl GateKind {
    /// Resolve a gate by name against the registered table.
    ///
    /// # Errors
    ///
    /// Unregistered names fail with `UnknownGate`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "h" => Ok(GateKind::H),
            "x" => Ok(GateKind::X),
            "y" => Ok(GateKind::Y),
            "z" => Ok(GateKind::Z),
            "s" => Ok(GateKind::S),
            "t" => Ok(GateKind::T),
            "cx" | "cnot" => Ok(GateKind::Cnot),
            "swap" => Ok(GateKind::Swap),
            other => Err(SimulationError::UnknownGate(other.to_string())),
        }
    }

    /// Number of qubits the gate acts on.
    pub fn arity(self) -> usize {
        match self {
            GateKind::Cnot | GateKind::Swap => 2,
            _ => 1,
        }
    }
}

/// Registered gate matrices, row-major over the gate's local basis.
static GATE_TABLE: Lazy<HashMap<GateKind, Array2<Complex64>>> = Lazy::new(|| {
    let re = |x: f64| Complex64::new(x, 0.0);
    let im = |x: f64| Complex64::new(0.0, x);
    let mut table = HashMap::new();
    table.insert(
        GateKind::H,
        Array2::from_shape_vec(
            (2, 2),
            vec![
                re(FRAC_1_SQRT_2),
                re(FRAC_1_SQRT_2),
                re(FRAC_1_SQRT_2),
                re(-FRAC_1_SQRT_2),
            ],
        )
        .expect("H shape"),
    );
    table.insert(
        GateKind::X,
        Array2::from_shape_vec((2, 2), vec![re(0.0), re(1.0), re(1.0), re(0.0)]).expect("X shape"),
    );
    table.insert(
        GateKind::Y,
        Array2::from_shape_vec((2, 2), vec![re(0.0), im(-1.0), im(1.0), re(0.0)]).expect("Y shape"),
    );
    table.insert(
        GateKind::Z,
        Array2::from_shape_vec((2, 2), vec![re(1.0), re(0.0), re(0.0), re(-1.0)]).expect("Z shape"),
    );
    table.insert(
        GateKind::S,
        Array2::from_shape_vec((2, 2), vec![re(1.0), re(0.0), re(0.0), im(1.0)]).expect("S shape"),
    );
    table.insert(
        GateKind::T,
        Array2::from_shape_vec(
            (2, 2),
            vec![
                re(1.0),
                re(0.0),
                re(0.0),
                Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4),
            ],
        )
        .expect("T shape"),
    );
    let mut cnot = Array2::from_elem((4, 4), re(0.0));
    cnot[(0, 0)] = re(1.0);
    cnot[(1, 1)] = re(1.0);
    cnot[(2, 3)] = re(1.0);
    cnot[(3, 2)] = re(1.0);
    table.insert(GateKind::Cnot, cnot);
    let mut swap = Array2::from_elem((4, 4), re(0.0));
    swap[(0, 0)] = re(1.0);
    swap[(1, 2)] = re(1.0);
    swap[(2, 1)] = re(1.0);
    swap[(3, 3)] = re(1.0);
    table.insert(GateKind::Swap, swap);
    table
});

/// One gate application inside a circuit.
#[derive(Debug, Clone)]
pub struct GateOp {
    pub kind: GateKind,
    pub qubits: SmallVec<[usize; 2]>,
}

/// A gate list plus the set of qubits measured at the end.
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    size: usize,
    gates: Vec<GateOp>,
    measured: Vec<usize>,
}

impl Circuit {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            gates: Vec::new(),
            measured: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gates(&self) -> &[GateOp] {
        &self.gates
    }

    pub fn measured(&self) -> &[usize] {
        &self.measured
    }

    fn check_qubits(&self, qubits: &[usize]) -> Result<()> {
        for &q in qubits {
            if q >= self.size {
                return Err(SimulationError::Precondition(format!(
                    "qubit {q} out of range for circuit of size {}",
                    self.size
                )));
            }
            if self.measured.contains(&q) {
                return Err(SimulationError::Precondition(format!(
                    "qubit {q} already measured"
                )));
            }
        }
        Ok(())
    }

    /// Append a gate acting on `qubits`.
    pub fn gate(&mut self, kind: GateKind, qubits: &[usize]) -> Result<()> {
        if qubits.len() != kind.arity() {
            return Err(SimulationError::Precondition(format!(
                "gate {kind:?} expects {} qubits, got {}",
                kind.arity(),
                qubits.len()
            )));
        }
        self.check_qubits(qubits)?;
        self.gates.push(GateOp {
            kind,
            qubits: SmallVec::from_slice(qubits),
        });
        Ok(())
    }

    pub fn h(&mut self, q: usize) -> Result<()> {
        self.gate(GateKind::H, &[q])
    }

    pub fn x(&mut self, q: usize) -> Result<()> {
        self.gate(GateKind::X, &[q])
    }

    pub fn z(&mut self, q: usize) -> Result<()> {
        self.gate(GateKind::Z, &[q])
    }

    pub fn cx(&mut self, control: usize, target: usize) -> Result<()> {
        self.gate(GateKind::Cnot, &[control, target])
    }

    /// Mark `q` for measurement after the gate list runs.
    pub fn measure(&mut self, q: usize) -> Result<()> {
        self.check_qubits(&[q])?;
        self.measured.push(q);
        Ok(())
    }
}

/// The selectable representation, frozen once the manager is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formalism {
    Ket,
    Density,
    BellDiagonal,
}

/// Factory table the formalism variants register themselves in.
static FORMALISM_REGISTRY: Lazy<RwLock<HashMap<String, Formalism>>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert("ket".to_string(), Formalism::Ket);
    table.insert("ket_vector".to_string(), Formalism::Ket);
    table.insert("density".to_string(), Formalism::Density);
    table.insert("fock_density".to_string(), Formalism::Density);
    table.insert("bell_diagonal".to_string(), Formalism::BellDiagonal);
    table.insert("bds".to_string(), Formalism::BellDiagonal);
    RwLock::new(table)
});

/// Register an additional name for a formalism variant.
pub fn register_formalism(name: &str, formalism: Formalism) {
    FORMALISM_REGISTRY
        .write()
        .insert(name.to_string(), formalism);
}

impl Formalism {
    /// Startup selector: resolve a formalism by registered name.
    ///
    /// # Errors
    ///
    /// Unregistered names are a `Configuration` error (fatal at init).
    pub fn from_name(name: &str) -> Result<Self> {
        FORMALISM_REGISTRY
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| SimulationError::Configuration(format!("unknown formalism: {name}")))
    }
}

/// Stored representation of one (possibly joint) state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateRepr {
    Ket(Vec<Complex64>),
    Density(Array2<Complex64>),
    BellDiag([f64; 4]),
}

/// A read-out of one state: its amplitudes and the full co-owning key list.
#[derive(Debug, Clone)]
pub struct StateView {
    pub keys: Vec<StateKey>,
    pub repr: StateRepr,
}

#[derive(Debug, Clone)]
struct SharedState {
    keys: SmallVec<[StateKey; 4]>,
    repr: StateRepr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GateCacheKey {
    state_bits: Vec<(u64, u64)>,
    kind: GateKind,
    qubits: SmallVec<[usize; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MeasCacheKey {
    state_bits: Vec<(u64, u64)>,
    qubits: SmallVec<[usize; 4]>,
}

#[derive(Debug, Clone)]
struct MeasOutcomes {
    probabilities: Vec<f64>,
    /// Projected, renormalized full state per outcome (empty when p = 0)
    post_states: Vec<Vec<Complex64>>,
}

fn state_bits(amplitudes: &[Complex64]) -> Vec<(u64, u64)> {
    amplitudes
        .iter()
        .map(|a| (a.re.to_bits(), a.im.to_bits()))
        .collect()
}

/// The four Bell amplitude vectors, matching the Bell-diagonal ordering.
pub fn bell_state(index: usize) -> Vec<Complex64> {
    let h = Complex64::new(FRAC_1_SQRT_2, 0.0);
    let z = Complex64::new(0.0, 0.0);
    match index {
        0 => vec![h, z, z, h],  // Phi+
        1 => vec![z, h, h, z],  // Psi+
        2 => vec![h, z, z, -h], // Phi-
        _ => vec![z, h, -h, z], // Psi-
    }
}

/// Shared store of quantum states with a frozen formalism.
pub struct QuantumManager {
    formalism: Formalism,
    entries: HashMap<StateKey, u64>,
    store: HashMap<u64, SharedState>,
    next_key: StateKey,
    next_state: u64,
    gate_cache: Mutex<LruCache<GateCacheKey, Vec<Complex64>>>,
    meas_cache: Mutex<LruCache<MeasCacheKey, MeasOutcomes>>,
    gate_hits: u64,
    meas_hits: u64,
}

impl std::fmt::Debug for QuantumManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantumManager")
            .field("formalism", &self.formalism)
            .field("keys", &self.entries.len())
            .field("states", &self.store.len())
            .field("gate_hits", &self.gate_hits)
            .field("meas_hits", &self.meas_hits)
            .finish()
    }
}

impl QuantumManager {
    pub fn new(formalism: Formalism, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("nonzero cache capacity");
        Self {
            formalism,
            entries: HashMap::new(),
            store: HashMap::new(),
            next_key: 0,
            next_state: 0,
            gate_cache: Mutex::new(LruCache::new(capacity)),
            meas_cache: Mutex::new(LruCache::new(capacity)),
            gate_hits: 0,
            meas_hits: 0,
        }
    }

    /// Startup construction through the formalism factory table.
    pub fn with_formalism_name(name: &str, cache_capacity: usize) -> Result<Self> {
        Ok(Self::new(Formalism::from_name(name)?, cache_capacity))
    }

    pub fn formalism(&self) -> Formalism {
        self.formalism
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn repr_for(&self, amplitudes: &[Complex64]) -> StateRepr {
        match self.formalism {
            Formalism::Density => {
                let n = amplitudes.len();
                let mut rho = Array2::from_elem((n, n), Complex64::new(0.0, 0.0));
                for i in 0..n {
                    for j in 0..n {
                        rho[(i, j)] = amplitudes[i] * amplitudes[j].conj();
                    }
                }
                StateRepr::Density(rho)
            }
            _ => StateRepr::Ket(amplitudes.to_vec()),
        }
    }

    /// Allocate a fresh key holding `amplitudes`.
    pub fn new_key(&mut self, amplitudes: &[Complex64]) -> Result<StateKey> {
        if !amplitudes.len().is_power_of_two() {
            return Err(SimulationError::Precondition(format!(
                "amplitude vector of length {} is not a power of two",
                amplitudes.len()
            )));
        }
        let key = self.next_key;
        self.next_key += 1;
        let state_id = self.next_state;
        self.next_state += 1;
        self.store.insert(
            state_id,
            SharedState {
                keys: SmallVec::from_slice(&[key]),
                repr: self.repr_for(amplitudes),
            },
        );
        self.entries.insert(key, state_id);
        Ok(key)
    }

    /// Replace the state shared by `keys`. All prior keys of the affected
    /// states are unbound first; `keys` then co-own the fresh state.
    pub fn set(&mut self, keys: &[StateKey], amplitudes: &[Complex64]) -> Result<()> {
        let expected = 1usize
            .checked_shl(keys.len() as u32)
            .ok_or_else(|| SimulationError::Precondition("too many keys".to_string()))?;
        if amplitudes.len() != expected {
            return Err(SimulationError::Precondition(format!(
                "{} keys require {expected} amplitudes, got {}",
                keys.len(),
                amplitudes.len()
            )));
        }
        self.unbind_states_of(keys);
        let state_id = self.next_state;
        self.next_state += 1;
        self.store.insert(
            state_id,
            SharedState {
                keys: SmallVec::from_slice(keys),
                repr: self.repr_for(amplitudes),
            },
        );
        for &key in keys {
            self.entries.insert(key, state_id);
        }
        Ok(())
    }

    /// Replace the bipartite state of two keys with a Bell-diagonal tuple.
    ///
    /// Only meaningful in the Bell-diagonal formalism; other formalisms store
    /// the closest pure Bell state (the dominant component).
    pub fn set_bell_diagonal(&mut self, keys: [StateKey; 2], probabilities: [f64; 4]) -> Result<()> {
        if self.formalism != Formalism::BellDiagonal {
            let dominant = probabilities
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).expect("finite probabilities"))
                .map(|(i, _)| i)
                .unwrap_or(0);
            return self.set(&keys, &bell_state(dominant));
        }
        self.unbind_states_of(&keys);
        let state_id = self.next_state;
        self.next_state += 1;
        self.store.insert(
            state_id,
            SharedState {
                keys: SmallVec::from_slice(&keys),
                repr: StateRepr::BellDiag(probabilities),
            },
        );
        for &key in &keys {
            self.entries.insert(key, state_id);
        }
        Ok(())
    }

    fn unbind_states_of(&mut self, keys: &[StateKey]) {
        let mut affected: SmallVec<[u64; 4]> = SmallVec::new();
        for key in keys {
            if let Some(&sid) = self.entries.get(key) {
                if !affected.contains(&sid) {
                    affected.push(sid);
                }
            }
        }
        for sid in affected {
            if let Some(state) = self.store.remove(&sid) {
                for key in state.keys {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Current amplitudes and the co-owning key list for `key`.
    pub fn get(&self, key: StateKey) -> Result<StateView> {
        let sid = self
            .entries
            .get(&key)
            .ok_or(SimulationError::UnknownState(key))?;
        let state = self
            .store
            .get(sid)
            .ok_or(SimulationError::UnknownState(key))?;
        Ok(StateView {
            keys: state.keys.to_vec(),
            repr: state.repr.clone(),
        })
    }

    /// Bell-diagonal tuple of a bipartite state.
    pub fn bell_diagonal(&self, key: StateKey) -> Result<[f64; 4]> {
        match self.get(key)?.repr {
            StateRepr::BellDiag(p) => Ok(p),
            _ => Err(SimulationError::Protocol(
                "state is not bell-diagonal".to_string(),
            )),
        }
    }

    /// Classical readout of a collapsed single-qubit state.
    pub fn read_bit(&self, key: StateKey) -> Result<u8> {
        let view = self.get(key)?;
        match view.repr {
            StateRepr::Ket(amps) if amps.len() == 2 => {
                Ok(u8::from(amps[1].norm_sqr() > amps[0].norm_sqr()))
            }
            StateRepr::Density(rho) if rho.nrows() == 2 => {
                Ok(u8::from(rho[(1, 1)].re > rho[(0, 0)].re))
            }
            _ => Err(SimulationError::Protocol(
                "read_bit requires a collapsed single-qubit state".to_string(),
            )),
        }
    }

    /// Unbind a key. Other co-owners stay bound; a key-less state is dropped.
    pub fn remove(&mut self, key: StateKey) -> Result<()> {
        let sid = self
            .entries
            .remove(&key)
            .ok_or(SimulationError::UnknownState(key))?;
        if let Some(state) = self.store.get_mut(&sid) {
            state.keys.retain(|k| *k != key);
            if state.keys.is_empty() {
                self.store.remove(&sid);
            }
        }
        Ok(())
    }

    pub fn cache_hits(&self) -> (u64, u64) {
        (self.gate_hits, self.meas_hits)
    }

    /// Prepare a joint state over `keys`, apply `circuit`, then measure the
    /// indicated qubits using `meas_sample` in `[0, 1)`. Returns the classical
    /// outcome per measured key; afterwards the joint state is split into the
    /// product of measured singletons and the unmeasured remainder.
    pub fn run_circuit(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_sample: f64,
    ) -> Result<HashMap<StateKey, u8>> {
        if circuit.size() != keys.len() {
            return Err(SimulationError::Precondition(format!(
                "circuit of size {} run over {} keys",
                circuit.size(),
                keys.len()
            )));
        }
        if circuit.gates().is_empty() && circuit.measured().is_empty() {
            // No-op by contract: state identity and contents unchanged
            for &key in keys {
                if !self.entries.contains_key(&key) {
                    return Err(SimulationError::UnknownState(key));
                }
            }
            return Ok(HashMap::new());
        }
        match self.formalism {
            Formalism::Ket => self.run_circuit_ket(circuit, keys, meas_sample),
            Formalism::Density => self.run_circuit_density(circuit, keys, meas_sample),
            Formalism::BellDiagonal => Err(SimulationError::Protocol(
                "circuit execution is not defined in the bell_diagonal formalism".to_string(),
            )),
        }
    }

    fn run_circuit_ket(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_sample: f64,
    ) -> Result<HashMap<StateKey, u8>> {
        let (mut order, mut amps) = self.compose(keys)?;
        // Reorder through a chain of SWAP gates so keys[i] sits at position i
        for (target, &key) in keys.iter().enumerate() {
            let position = order
                .iter()
                .position(|k| *k == key)
                .ok_or(SimulationError::UnknownState(key))?;
            if position != target {
                amps = apply_ket_gate_uncached(
                    &amps,
                    GateKind::Swap,
                    &[target, position],
                    order.len(),
                )?;
                order.swap(target, position);
            }
        }

        for op in circuit.gates() {
            amps = self.apply_ket_gate(&amps, op.kind, &op.qubits, order.len())?;
        }

        let mut outcomes = HashMap::new();
        if circuit.measured().is_empty() {
            self.bind_joint(&order, &amps);
            return Ok(outcomes);
        }

        let measured: SmallVec<[usize; 4]> = SmallVec::from_slice(circuit.measured());
        let dist = self.measure_distribution(&amps, &measured, order.len());
        let mut outcome_index = dist.probabilities.len() - 1;
        let mut cumulative = 0.0;
        for (i, &p) in dist.probabilities.iter().enumerate() {
            cumulative += p;
            if meas_sample < cumulative {
                outcome_index = i;
                break;
            }
        }
        let post = &dist.post_states[outcome_index];

        // Split off measured singletons
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        for (bit_pos, &qubit) in measured.iter().enumerate() {
            let bit = (outcome_index >> (measured.len() - 1 - bit_pos)) & 1;
            let key = order[qubit];
            outcomes.insert(key, bit as u8);
            let amplitudes = if bit == 0 {
                [one, zero]
            } else {
                [zero, one]
            };
            self.set(&[key], &amplitudes)?;
        }

        // Collapse the remainder onto the unmeasured qubits
        let remaining: Vec<usize> = (0..order.len()).filter(|q| !measured.contains(q)).collect();
        if !remaining.is_empty() {
            let n = order.len();
            let mut rem = vec![zero; 1 << remaining.len()];
            for (full_index, amp) in post.iter().enumerate() {
                if amp.norm_sqr() == 0.0 {
                    continue;
                }
                let mut rem_index = 0usize;
                for (slot, &q) in remaining.iter().enumerate() {
                    let bit = (full_index >> (n - 1 - q)) & 1;
                    rem_index |= bit << (remaining.len() - 1 - slot);
                }
                rem[rem_index] = *amp;
            }
            let norm: f64 = rem.iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt();
            if norm > 0.0 {
                for a in &mut rem {
                    *a /= norm;
                }
            }
            let rem_keys: Vec<StateKey> = remaining.iter().map(|&q| order[q]).collect();
            self.set(&rem_keys, &rem)?;
        }

        Ok(outcomes)
    }

    fn run_circuit_density(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_sample: f64,
    ) -> Result<HashMap<StateKey, u8>> {
        let (mut order, mut rho) = self.compose_density(keys)?;
        let n = order.len();
        for (target, &key) in keys.iter().enumerate() {
            let position = order
                .iter()
                .position(|k| *k == key)
                .ok_or(SimulationError::UnknownState(key))?;
            if position != target {
                let swap = embed_unitary(GateKind::Swap, &[target, position], n)?;
                rho = swap.dot(&rho).dot(&dagger(&swap));
                order.swap(target, position);
            }
        }

        for op in circuit.gates() {
            let unitary = embed_unitary(op.kind, &op.qubits, n)?;
            rho = unitary.dot(&rho).dot(&dagger(&unitary));
        }

        let mut outcomes = HashMap::new();
        if circuit.measured().is_empty() {
            self.bind_density(&order, rho);
            return Ok(outcomes);
        }

        let measured = circuit.measured();
        let outcome_count = 1usize << measured.len();
        let outcome_of = |index: usize| -> usize {
            let mut outcome = 0usize;
            for (slot, &q) in measured.iter().enumerate() {
                let bit = (index >> (n - 1 - q)) & 1;
                outcome |= bit << (measured.len() - 1 - slot);
            }
            outcome
        };
        let mut probabilities = vec![0.0f64; outcome_count];
        for index in 0..rho.nrows() {
            probabilities[outcome_of(index)] += rho[(index, index)].re;
        }
        let mut outcome_index = outcome_count - 1;
        let mut cumulative = 0.0;
        for (i, &p) in probabilities.iter().enumerate() {
            cumulative += p;
            if meas_sample < cumulative {
                outcome_index = i;
                break;
            }
        }
        let p = probabilities[outcome_index].max(f64::MIN_POSITIVE);
        let zero = Complex64::new(0.0, 0.0);
        let mut projected = Array2::from_elem(rho.dim(), zero);
        for i in 0..rho.nrows() {
            if outcome_of(i) != outcome_index {
                continue;
            }
            for j in 0..rho.ncols() {
                if outcome_of(j) == outcome_index {
                    projected[(i, j)] = rho[(i, j)] / p;
                }
            }
        }

        let one = Complex64::new(1.0, 0.0);
        for (slot, &qubit) in measured.iter().enumerate() {
            let bit = (outcome_index >> (measured.len() - 1 - slot)) & 1;
            let key = order[qubit];
            outcomes.insert(key, bit as u8);
            let amplitudes = if bit == 0 { [one, zero] } else { [zero, one] };
            self.set(&[key], &amplitudes)?;
        }

        // Trace out the measured qubits for the remainder
        let remaining: Vec<usize> = (0..n).filter(|q| !measured.contains(q)).collect();
        if !remaining.is_empty() {
            let rem_dim = 1usize << remaining.len();
            let mut rem = Array2::from_elem((rem_dim, rem_dim), zero);
            let expand = |rem_index: usize, meas_bits: usize| -> usize {
                let mut full = 0usize;
                for (slot, &q) in remaining.iter().enumerate() {
                    let bit = (rem_index >> (remaining.len() - 1 - slot)) & 1;
                    full |= bit << (n - 1 - q);
                }
                for (slot, &q) in measured.iter().enumerate() {
                    let bit = (meas_bits >> (measured.len() - 1 - slot)) & 1;
                    full |= bit << (n - 1 - q);
                }
                full
            };
            for a in 0..rem_dim {
                for b in 0..rem_dim {
                    let mut value = zero;
                    for m in 0..outcome_count {
                        value += projected[(expand(a, m), expand(b, m))];
                    }
                    rem[(a, b)] = value;
                }
            }
            let trace: f64 = (0..rem_dim).map(|i| rem[(i, i)].re).sum();
            if trace > 0.0 {
                rem.mapv_inplace(|v| v / trace);
            }
            let rem_keys: Vec<StateKey> = remaining.iter().map(|&q| order[q]).collect();
            self.bind_density(&rem_keys, rem);
        }

        Ok(outcomes)
    }

    fn compose_density(&mut self, keys: &[StateKey]) -> Result<(Vec<StateKey>, Array2<Complex64>)> {
        let mut seen_states: Vec<u64> = Vec::new();
        for &key in keys {
            let sid = *self
                .entries
                .get(&key)
                .ok_or(SimulationError::UnknownState(key))?;
            if !seen_states.contains(&sid) {
                seen_states.push(sid);
            }
        }
        let mut order: Vec<StateKey> = Vec::new();
        let mut rho = Array2::from_elem((1, 1), Complex64::new(1.0, 0.0));
        for sid in seen_states {
            let state = self
                .store
                .get(&sid)
                .ok_or_else(|| SimulationError::Protocol("dangling state id".to_string()))?;
            let part = match &state.repr {
                StateRepr::Density(m) => m.clone(),
                StateRepr::Ket(v) => {
                    let n = v.len();
                    let mut m = Array2::from_elem((n, n), Complex64::new(0.0, 0.0));
                    for i in 0..n {
                        for j in 0..n {
                            m[(i, j)] = v[i] * v[j].conj();
                        }
                    }
                    m
                }
                StateRepr::BellDiag(_) => {
                    return Err(SimulationError::Protocol(
                        "bell-diagonal state in density composition".to_string(),
                    ))
                }
            };
            rho = kron(&rho, &part);
            order.extend(state.keys.iter().copied());
        }
        Ok((order, rho))
    }

    fn bind_density(&mut self, order: &[StateKey], rho: Array2<Complex64>) {
        self.unbind_states_of(order);
        let state_id = self.next_state;
        self.next_state += 1;
        self.store.insert(
            state_id,
            SharedState {
                keys: SmallVec::from_slice(order),
                repr: StateRepr::Density(rho),
            },
        );
        for &key in order {
            self.entries.insert(key, state_id);
        }
    }

    /// Tensor together the states covering `keys`, in order of first
    /// appearance, with any additional co-owners appended at the end.
    fn compose(&mut self, keys: &[StateKey]) -> Result<(Vec<StateKey>, Vec<Complex64>)> {
        let mut seen_states: Vec<u64> = Vec::new();
        for &key in keys {
            let sid = *self
                .entries
                .get(&key)
                .ok_or(SimulationError::UnknownState(key))?;
            if !seen_states.contains(&sid) {
                seen_states.push(sid);
            }
        }
        let mut order: Vec<StateKey> = Vec::new();
        let mut amps: Vec<Complex64> = vec![Complex64::new(1.0, 0.0)];
        for sid in seen_states {
            let state = self
                .store
                .get(&sid)
                .ok_or_else(|| SimulationError::Protocol("dangling state id".to_string()))?;
            let part = match &state.repr {
                StateRepr::Ket(v) => v.clone(),
                StateRepr::Density(_) => {
                    return Err(SimulationError::Protocol(
                        "density-matrix circuit execution uses the dedicated density path"
                            .to_string(),
                    ))
                }
                StateRepr::BellDiag(_) => unreachable!("guarded by formalism check"),
            };
            amps = tensor(&amps, &part);
            order.extend(state.keys.iter().copied());
        }
        Ok((order, amps))
    }

    fn bind_joint(&mut self, order: &[StateKey], amps: &[Complex64]) {
        self.unbind_states_of(order);
        let state_id = self.next_state;
        self.next_state += 1;
        self.store.insert(
            state_id,
            SharedState {
                keys: SmallVec::from_slice(order),
                repr: StateRepr::Ket(amps.to_vec()),
            },
        );
        for &key in order {
            self.entries.insert(key, state_id);
        }
    }

    fn apply_ket_gate(
        &mut self,
        amps: &[Complex64],
        kind: GateKind,
        qubits: &[usize],
        n: usize,
    ) -> Result<Vec<Complex64>> {
        let cache_key = GateCacheKey {
            state_bits: state_bits(amps),
            kind,
            qubits: SmallVec::from_slice(qubits),
        };
        if let Some(cached) = self.gate_cache.lock().get(&cache_key) {
            self.gate_hits += 1;
            return Ok(cached.clone());
        }
        let result = apply_ket_gate_uncached(amps, kind, qubits, n)?;
        self.gate_cache.lock().put(cache_key, result.clone());
        Ok(result)
    }

    fn measure_distribution(
        &mut self,
        amps: &[Complex64],
        measured: &SmallVec<[usize; 4]>,
        n: usize,
    ) -> MeasOutcomes {
        let cache_key = MeasCacheKey {
            state_bits: state_bits(amps),
            qubits: measured.clone(),
        };
        if let Some(cached) = self.meas_cache.lock().get(&cache_key) {
            self.meas_hits += 1;
            return cached.clone();
        }

        let outcome_count = 1usize << measured.len();
        let mut probabilities = vec![0.0f64; outcome_count];
        for (index, amp) in amps.iter().enumerate() {
            let mut outcome = 0usize;
            for (slot, &q) in measured.iter().enumerate() {
                let bit = (index >> (n - 1 - q)) & 1;
                outcome |= bit << (measured.len() - 1 - slot);
            }
            probabilities[outcome] += amp.norm_sqr();
        }

        let mut post_states = Vec::with_capacity(outcome_count);
        for outcome in 0..outcome_count {
            let p = probabilities[outcome];
            if p <= 0.0 {
                post_states.push(Vec::new());
                continue;
            }
            let mut projected = vec![Complex64::new(0.0, 0.0); amps.len()];
            for (index, amp) in amps.iter().enumerate() {
                let mut this_outcome = 0usize;
                for (slot, &q) in measured.iter().enumerate() {
                    let bit = (index >> (n - 1 - q)) & 1;
                    this_outcome |= bit << (measured.len() - 1 - slot);
                }
                if this_outcome == outcome {
                    projected[index] = amp / p.sqrt();
                }
            }
            post_states.push(projected);
        }

        let outcomes = MeasOutcomes {
            probabilities,
            post_states,
        };
        self.meas_cache.lock().put(cache_key, outcomes.clone());
        outcomes
    }
}

/// Tensor product, left factor on the high-order bits.
fn tensor(a: &[Complex64], b: &[Complex64]) -> Vec<Complex64> {
    let mut out = Vec::with_capacity(a.len() * b.len());
    for &x in a {
        for &y in b {
            out.push(x * y);
        }
    }
    out
}

/// Kronecker product, left factor on the high-order bits.
fn kron(a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::from_elem((ar * br, ac * bc), Complex64::new(0.0, 0.0));
    for i in 0..ar {
        for j in 0..ac {
            for k in 0..br {
                for l in 0..bc {
                    out[(i * br + k, j * bc + l)] = a[(i, j)] * b[(k, l)];
                }
            }
        }
    }
    out
}

fn dagger(m: &Array2<Complex64>) -> Array2<Complex64> {
    m.t().mapv(|v| v.conj())
}

/// Embed a registered gate on the given qubit positions of an n-qubit system.
fn embed_unitary(kind: GateKind, qubits: &[usize], n: usize) -> Result<Array2<Complex64>> {
    let matrix = GATE_TABLE
        .get(&kind)
        .ok_or_else(|| SimulationError::UnknownGate(format!("{kind:?}")))?;
    let k = qubits.len();
    let dim = 1usize << n;
    let shifts: SmallVec<[usize; 2]> = qubits.iter().map(|&q| n - 1 - q).collect();
    let gate_mask: usize = shifts.iter().map(|&s| 1usize << s).sum();
    let sub_of = |index: usize| -> usize {
        let mut sub = 0usize;
        for (slot, &shift) in shifts.iter().enumerate() {
            let bit = (index >> shift) & 1;
            sub |= bit << (k - 1 - slot);
        }
        sub
    };
    let mut out = Array2::from_elem((dim, dim), Complex64::new(0.0, 0.0));
    for i in 0..dim {
        for j in 0..dim {
            if i & !gate_mask == j & !gate_mask {
                out[(i, j)] = matrix[(sub_of(i), sub_of(j))];
            }
        }
    }
    Ok(out)
}

fn apply_ket_gate_uncached(
    amps: &[Complex64],
    kind: GateKind,
    qubits: &[usize],
    n: usize,
) -> Result<Vec<Complex64>> {
    let matrix = GATE_TABLE
        .get(&kind)
        .ok_or_else(|| SimulationError::UnknownGate(format!("{kind:?}")))?;
    let k = qubits.len();
    let sub_dim = 1usize << k;
    debug_assert_eq!(matrix.nrows(), sub_dim);
    for &q in qubits {
        if q >= n {
            return Err(SimulationError::Precondition(format!(
                "gate qubit {q} out of range for {n}-qubit state"
            )));
        }
    }

    let shifts: SmallVec<[usize; 2]> = qubits.iter().map(|&q| n - 1 - q).collect();
    let gate_mask: usize = shifts.iter().map(|&s| 1usize << s).sum();
    let mut out = vec![Complex64::new(0.0, 0.0); amps.len()];
    for base in 0..amps.len() {
        if base & gate_mask != 0 {
            continue;
        }
        // Gather the 2^k partner amplitudes of this residual index
        let mut partners: SmallVec<[usize; 4]> = SmallVec::new();
        for sub in 0..sub_dim {
            let mut index = base;
            for (slot, &shift) in shifts.iter().enumerate() {
                let bit = (sub >> (k - 1 - slot)) & 1;
                index |= bit << shift;
            }
            partners.push(index);
        }
        for row in 0..sub_dim {
            let mut value = Complex64::new(0.0, 0.0);
            for col in 0..sub_dim {
                value += matrix[(row, col)] * amps[partners[col]];
            }
            out[partners[row]] = value;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ket0() -> Vec<Complex64> {
        vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]
    }

    fn manager() -> QuantumManager {
        QuantumManager::new(Formalism::Ket, 64)
    }

    #[test]
    fn test_new_and_get_roundtrip() {
        let mut qm = manager();
        let key = qm.new_key(&ket0()).unwrap();
        let view = qm.get(key).unwrap();
        assert_eq!(view.keys, vec![key]);
        assert_eq!(view.repr, StateRepr::Ket(ket0()));
    }

    #[test]
    fn test_unknown_key_fails() {
        let qm = manager();
        assert!(matches!(
            qm.get(99),
            Err(SimulationError::UnknownState(99))
        ));
    }

    #[test]
    fn test_set_shares_state_across_keys() {
        let mut qm = manager();
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        qm.set(&[k1, k2], &bell_state(0)).unwrap();
        let v1 = qm.get(k1).unwrap();
        let v2 = qm.get(k2).unwrap();
        assert_eq!(v1.keys, vec![k1, k2]);
        assert_eq!(v1.keys, v2.keys);
    }

    #[test]
    fn test_empty_circuit_is_a_noop() {
        let mut qm = manager();
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        qm.set(&[k1, k2], &bell_state(0)).unwrap();
        let before = qm.get(k1).unwrap();
        let out = qm.run_circuit(&Circuit::new(2), &[k1, k2], 0.3).unwrap();
        assert!(out.is_empty());
        let after = qm.get(k1).unwrap();
        assert_eq!(before.keys, after.keys);
        assert_eq!(before.repr, after.repr);
    }

    #[test]
    fn test_double_x_restores_amplitudes_bitwise() {
        let mut qm = manager();
        let amps = vec![Complex64::new(0.6, 0.0), Complex64::new(0.8, 0.0)];
        let key = qm.new_key(&amps).unwrap();
        let mut circuit = Circuit::new(1);
        circuit.x(0).unwrap();
        circuit.x(0).unwrap();
        qm.run_circuit(&circuit, &[key], 0.0).unwrap();
        match qm.get(key).unwrap().repr {
            StateRepr::Ket(out) => {
                for (a, b) in out.iter().zip(amps.iter()) {
                    assert_eq!(a.re.to_bits(), b.re.to_bits());
                    assert_eq!(a.im.to_bits(), b.im.to_bits());
                }
            }
            other => panic!("unexpected repr {other:?}"),
        }
    }

    #[test]
    fn test_bell_pair_measurement_is_correlated() {
        for sample in [0.1, 0.9] {
            let mut qm = manager();
            let k1 = qm.new_key(&ket0()).unwrap();
            let k2 = qm.new_key(&ket0()).unwrap();
            let mut circuit = Circuit::new(2);
            circuit.h(0).unwrap();
            circuit.cx(0, 1).unwrap();
            circuit.measure(0).unwrap();
            circuit.measure(1).unwrap();
            let out = qm.run_circuit(&circuit, &[k1, k2], sample).unwrap();
            assert_eq!(out[&k1], out[&k2]);
            assert_eq!(qm.read_bit(k1).unwrap(), out[&k1]);
        }
    }

    #[test]
    fn test_measurement_splits_joint_state() {
        let mut qm = manager();
        let keys: Vec<StateKey> = (0..3).map(|_| qm.new_key(&ket0()).unwrap()).collect();
        let mut circuit = Circuit::new(3);
        circuit.h(0).unwrap();
        circuit.cx(0, 1).unwrap();
        circuit.cx(1, 2).unwrap();
        circuit.measure(2).unwrap();
        let out = qm.run_circuit(&circuit, &keys, 0.25).unwrap();
        assert_eq!(out.len(), 1);
        // Measured key is a singleton, the other two stay joint
        assert_eq!(qm.get(keys[2]).unwrap().keys, vec![keys[2]]);
        let joint = qm.get(keys[0]).unwrap();
        assert_eq!(joint.keys.len(), 2);
        assert!(joint.keys.contains(&keys[0]) && joint.keys.contains(&keys[1]));
    }

    #[test]
    fn test_key_order_permutation() {
        // Prepare |10> over (k1, k2), then run with keys reversed; X on
        // position 0 must act on k2.
        let mut qm = manager();
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        qm.set(&[k1, k2], &[zero, zero, one, zero]).unwrap();
        let mut circuit = Circuit::new(2);
        circuit.x(0).unwrap();
        circuit.measure(0).unwrap();
        circuit.measure(1).unwrap();
        let out = qm.run_circuit(&circuit, &[k2, k1], 0.5).unwrap();
        assert_eq!(out[&k2], 1);
        assert_eq!(out[&k1], 1);
    }

    #[test]
    fn test_remove_unbinds_single_key() {
        let mut qm = manager();
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        qm.set(&[k1, k2], &bell_state(0)).unwrap();
        qm.remove(k1).unwrap();
        assert!(qm.get(k1).is_err());
        assert_eq!(qm.get(k2).unwrap().keys, vec![k2]);
    }

    #[test]
    fn test_gate_cache_hits_on_repeat() {
        let mut qm = manager();
        for _ in 0..2 {
            let key = qm.new_key(&ket0()).unwrap();
            let mut circuit = Circuit::new(1);
            circuit.h(0).unwrap();
            qm.run_circuit(&circuit, &[key], 0.0).unwrap();
        }
        let (gate_hits, _) = qm.cache_hits();
        assert!(gate_hits >= 1);
    }

    #[test]
    fn test_bell_diagonal_roundtrip() {
        let mut qm = QuantumManager::new(Formalism::BellDiagonal, 16);
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        let probs = [0.85, 0.05, 0.05, 0.05];
        qm.set_bell_diagonal([k1, k2], probs).unwrap();
        assert_eq!(qm.bell_diagonal(k1).unwrap(), probs);
        assert_eq!(qm.get(k2).unwrap().keys, vec![k1, k2]);
    }

    #[test]
    fn test_formalism_registry() {
        assert_eq!(Formalism::from_name("ket").unwrap(), Formalism::Ket);
        assert_eq!(
            Formalism::from_name("fock_density").unwrap(),
            Formalism::Density
        );
        assert!(Formalism::from_name("stabilizer").is_err());
        register_formalism("werner", Formalism::BellDiagonal);
        assert_eq!(
            Formalism::from_name("werner").unwrap(),
            Formalism::BellDiagonal
        );
    }

    #[test]
    fn test_density_formalism_circuit() {
        let mut qm = QuantumManager::new(Formalism::Density, 16);
        let k1 = qm.new_key(&ket0()).unwrap();
        let k2 = qm.new_key(&ket0()).unwrap();
        let mut circuit = Circuit::new(2);
        circuit.h(0).unwrap();
        circuit.cx(0, 1).unwrap();
        circuit.measure(0).unwrap();
        circuit.measure(1).unwrap();
        let out = qm.run_circuit(&circuit, &[k1, k2], 0.7).unwrap();
        assert_eq!(out[&k1], out[&k2]);
        match qm.get(k1).unwrap().repr {
            StateRepr::Density(rho) => {
                assert_eq!(rho.nrows(), 2);
                let trace = rho[(0, 0)].re + rho[(1, 1)].re;
                assert!((trace - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected repr {other:?}"),
        }
    }

    #[test]
    fn test_unknown_gate_name() {
        assert!(matches!(
            GateKind::from_name("toffoli"),
            Err(SimulationError::UnknownGate(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_double_x_is_bitwise_identity(theta in 0.0f64..std::f64::consts::PI) {
            let amps = vec![
                Complex64::new(theta.cos(), 0.0),
                Complex64::new(theta.sin(), 0.0),
            ];
            let mut qm = QuantumManager::new(Formalism::Ket, 8);
            let key = qm.new_key(&amps).unwrap();
            let mut circuit = Circuit::new(1);
            circuit.x(0).unwrap();
            circuit.x(0).unwrap();
            qm.run_circuit(&circuit, &[key], 0.0).unwrap();
            match qm.get(key).unwrap().repr {
                StateRepr::Ket(out) => {
                    for (a, b) in out.iter().zip(amps.iter()) {
                        proptest::prop_assert_eq!(a.re.to_bits(), b.re.to_bits());
                        proptest::prop_assert_eq!(a.im.to_bits(), b.im.to_bits());
                    }
                }
                other => proptest::prop_assert!(false, "unexpected repr {:?}", other),
            }
        }
    }
}
