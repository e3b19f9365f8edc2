//! # Simulation Kernel
//!
//! Deterministic, seedable event scheduling. Events are ordered by
//! (time ascending, priority ascending, insertion counter ascending); the
//! ordering is total and stable, so no two events compare equal unless they
//! are the same event. All times are integer picoseconds. Where sub-picosecond
//! precision is needed (channel transmit scheduling with fractional propagation
//! times), the [`Rational`] helper keeps truncation consistent across hosts.
//!
//! The run loop itself lives in [`crate::simulation::Simulation::run`]; the
//! timeline owns the clock, the queue, and the seed every entity generator
//! derives from.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Sha3_256};
use tracing::{debug, info};

use crate::hardware::{Photon, PulseTrain};
use crate::messages::Message;
use crate::network_manager::ReservationId;
use crate::{Result, SimulationError, PS_PER_SEC};

/// Simulated time in integer picoseconds.
pub type SimTime = u64;

/// Unique event identifier; doubles as the monotonic insertion counter.
pub type EventId = u64;

/// Identifier of a protocol instance on some node.
pub type ProtocolId = u64;

/// Default event priority: lowest urgency on time ties.
pub const DEFAULT_PRIORITY: u64 = u64::MAX;

/// A scheduled operation: the owner entity plus the typed arguments of the
/// operation to invoke on it at dispatch time.
#[derive(Debug, Clone)]
pub enum Process {
    /// Deliver a classical message to `dst` (scheduled by channel transmit)
    DeliverMessage {
        dst: String,
        src: String,
        message: Message,
    },
    /// Deliver a single photon to `dst` (heralded-generation path)
    DeliverPhoton { dst: String, photon: Photon },
    /// Deliver a batched QKD pulse train to `dst`
    DeliverPulseTrain {
        dst: String,
        src: String,
        train: PulseTrain,
    },
    /// Start a paired protocol instance on `node`
    StartProtocol { node: String, protocol: ProtocolId },
    /// Fire one emission round of a generation protocol
    EmitRound {
        node: String,
        protocol: ProtocolId,
        round: u8,
    },
    /// Tally herald results after the final emission round
    ResolveRounds { node: String, protocol: ProtocolId },
    /// Coherence-cutoff expiry of one memory slot
    ExpireMemory { node: String, index: usize },
    /// Activate the rules staged for a reservation window
    InstallRules {
        node: String,
        reservation: ReservationId,
    },
    /// Tear down the rules tied to a reservation window
    ExpireRules {
        node: String,
        reservation: ReservationId,
    },
    /// Emit the next BB84 pulse batch from `node`
    EmitPulseTrain { node: String, batch: u32 },
}

/// A dispatched event as seen by the run loop.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub time: SimTime,
    pub priority: u64,
    pub process: Process,
}

/// Heap entry. `Ord` is reversed so the `BinaryHeap` pops the minimum of
/// (time, priority, counter); the counter makes the order total.
#[derive(Debug)]
struct QueuedEvent {
    time: SimTime,
    priority: u64,
    counter: u64,
    process: Process,
}

impl QueuedEvent {
    fn key(&self) -> (SimTime, u64, u64) {
        (self.time, self.priority, self.counter)
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

/// The master clock and event queue of one simulation.
///
/// Invariants: during a run, `now()` is monotonically non-decreasing and
/// equals the dispatch time of the last executed event; an event's time and
/// priority are immutable once enqueued, only its removed flag may change.
#[derive(Debug)]
pub struct Timeline {
    now: SimTime,
    stop_time: SimTime,
    running: bool,
    seed: u64,
    counter: u64,
    executed: u64,
    queue: BinaryHeap<QueuedEvent>,
    removed: HashSet<EventId>,
    /// Emit a progress line every this many executed events
    pub progress_interval: Option<u64>,
}

impl Timeline {
    pub fn new(seed: u64) -> Self {
        Self {
            now: 0,
            stop_time: SimTime::MAX,
            running: false,
            seed,
            counter: 0,
            executed: 0,
            queue: BinaryHeap::new(),
            removed: HashSet::new(),
            progress_interval: None,
        }
    }

    /// Current simulated time: the dispatch time of the last executed event,
    /// or the initial time outside a run.
    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn stop_time(&self) -> SimTime {
        self.stop_time
    }

    pub fn set_stop_time(&mut self, stop_time: SimTime) {
        self.stop_time = stop_time;
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn executed_events(&self) -> u64 {
        self.executed
    }

    /// Number of events enqueued so far (the insertion counter).
    pub fn schedule_counter(&self) -> u64 {
        self.counter
    }

    /// Enqueue `process` at `time` with an explicit tie-break priority.
    ///
    /// # Errors
    ///
    /// Scheduling in the past is a precondition violation; the run aborts.
    pub fn schedule(&mut self, time: SimTime, priority: u64, process: Process) -> Result<EventId> {
        if time < self.now {
            return Err(SimulationError::Precondition(format!(
                "schedule at {time} ps before current time {} ps",
                self.now
            )));
        }
        let id = self.counter;
        self.counter += 1;
        self.queue.push(QueuedEvent {
            time,
            priority,
            counter: id,
            process,
        });
        Ok(id)
    }

    /// Enqueue with the tie-break priority pinned to the current insertion
    /// counter, preserving submission order when priorities would collide.
    /// Heralded generation relies on this for equidistant middle nodes.
    pub fn schedule_counter_pinned(&mut self, time: SimTime, process: Process) -> Result<EventId> {
        let priority = self.counter;
        self.schedule(time, priority, process)
    }

    /// Mark an enqueued event as removed. It keeps its queue slot until popped
    /// and is then discarded without dispatching.
    pub fn remove_event(&mut self, id: EventId) {
        self.removed.insert(id);
    }

    /// Reset run bookkeeping. Scheduled events and the clock are preserved.
    pub fn init(&mut self) {
        self.executed = 0;
        self.running = false;
        debug!(seed = self.seed, queued = self.queue.len(), "timeline initialized");
    }

    /// Request loop termination after the current dispatch.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub(crate) fn begin_run(&mut self) {
        self.running = true;
    }

    /// Pop the next dispatchable event, advancing the clock to its time.
    ///
    /// Returns `None` when the queue is exhausted or the next event lies at or
    /// beyond the stop time (the event stays queued in that case).
    pub(crate) fn next_event(&mut self) -> Option<Event> {
        loop {
            let head_time = self.queue.peek()?.time;
            if head_time >= self.stop_time {
                return None;
            }
            let entry = self.queue.pop()?;
            if self.removed.remove(&entry.counter) {
                continue;
            }
            debug_assert!(entry.time >= self.now, "event queue yielded a past event");
            self.now = entry.time;
            self.executed += 1;
            if let Some(interval) = self.progress_interval {
                if self.executed % interval == 0 {
                    info!(
                        executed = self.executed,
                        now_ps = self.now,
                        queued = self.queue.len(),
                        "simulation progress"
                    );
                }
            }
            return Some(Event {
                id: entry.counter,
                time: entry.time,
                priority: entry.priority,
                process: entry.process,
            });
        }
    }

    /// Derive the deterministic generator of the entity named `name`.
    ///
    /// Seeded from (timeline seed, entity name) through SHA-3 conditioning, so
    /// reproducibility is independent of entity-construction order.
    pub fn derive_rng(&self, name: &str) -> ChaCha20Rng {
        derive_entity_rng(self.seed, name)
    }
}

/// SHA-3 conditioned ChaCha20 generator for `(seed, name)`.
pub fn derive_entity_rng(seed: u64, name: &str) -> ChaCha20Rng {
    let mut hasher = Sha3_256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    ChaCha20Rng::from_seed(key)
}

/// Exact ratio of two integers, used wherever a physical quantity divides the
/// picosecond grid (channel propagation, emission periods). Keeping the
/// division in integer arithmetic guarantees that no two events inserted for
/// time T land at T-1 or T+1 due to floating rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i128,
    pub den: i128,
}

impl Rational {
    pub fn new(num: i128, den: i128) -> Self {
        debug_assert!(den != 0, "rational with zero denominator");
        if den < 0 {
            Self { num: -num, den: -den }
        } else {
            Self { num, den }
        }
    }

    /// Round half-up to the nearest integer.
    pub fn round(self) -> i128 {
        let (q, r) = (self.num.div_euclid(self.den), self.num.rem_euclid(self.den));
        if 2 * r >= self.den {
            q + 1
        } else {
            q
        }
    }
}

/// Propagation delay in integer picoseconds for a fiber span.
///
/// The span length is snapped to integer picometers once; the division by the
/// propagation speed stays exact, so the result is host-independent.
pub fn precise_delay_ps(length_m: f64, speed_m_s: u64) -> SimTime {
    let length_pm = (length_m * 1e12).round() as i128;
    Rational::new(length_pm, speed_m_s as i128).round().max(0) as SimTime
}

/// Emission period in integer picoseconds for a repetition rate in Hz.
///
/// The rate is snapped to integer millihertz once, keeping the period exact.
pub fn precise_period_ps(frequency_hz: f64) -> SimTime {
    let freq_mhz = ((frequency_hz * 1e3).round() as i128).max(1);
    Rational::new(PS_PER_SEC as i128 * 1000, freq_mhz).round().max(1) as SimTime
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn probe(node: &str) -> Process {
        Process::ExpireMemory {
            node: node.to_string(),
            index: 0,
        }
    }

    fn drain_nodes(tl: &mut Timeline) -> Vec<String> {
        tl.begin_run();
        let mut order = Vec::new();
        while let Some(event) = tl.next_event() {
            if let Process::ExpireMemory { node, .. } = event.process {
                order.push(node);
            }
        }
        order
    }

    #[test]
    fn test_events_pop_in_time_order() {
        let mut tl = Timeline::new(0);
        tl.schedule(30, DEFAULT_PRIORITY, probe("c")).unwrap();
        tl.schedule(10, DEFAULT_PRIORITY, probe("a")).unwrap();
        tl.schedule(20, DEFAULT_PRIORITY, probe("b")).unwrap();
        assert_eq!(drain_nodes(&mut tl), vec!["a", "b", "c"]);
        assert_eq!(tl.now(), 30);
    }

    #[test]
    fn test_priority_breaks_time_ties() {
        // Scenario: two events at the same time with P1 < P2 on different
        // owners dispatch in priority order regardless of insertion order.
        let mut tl = Timeline::new(0);
        tl.schedule(50, 2, probe("low")).unwrap();
        tl.schedule(50, 1, probe("high")).unwrap();
        assert_eq!(drain_nodes(&mut tl), vec!["high", "low"]);
    }

    #[test]
    fn test_counter_breaks_priority_ties() {
        let mut tl = Timeline::new(0);
        tl.schedule(50, 7, probe("first")).unwrap();
        tl.schedule(50, 7, probe("second")).unwrap();
        assert_eq!(drain_nodes(&mut tl), vec!["first", "second"]);
    }

    #[test]
    fn test_counter_pinned_priority_precedes_default() {
        let mut tl = Timeline::new(0);
        tl.schedule(50, DEFAULT_PRIORITY, probe("late")).unwrap();
        tl.schedule_counter_pinned(50, probe("pinned")).unwrap();
        assert_eq!(drain_nodes(&mut tl), vec!["pinned", "late"]);
    }

    #[test]
    fn test_removed_events_are_skipped() {
        let mut tl = Timeline::new(0);
        let id = tl.schedule(10, DEFAULT_PRIORITY, probe("gone")).unwrap();
        tl.schedule(20, DEFAULT_PRIORITY, probe("kept")).unwrap();
        tl.remove_event(id);
        assert_eq!(drain_nodes(&mut tl), vec!["kept"]);
    }

    #[test]
    fn test_schedule_in_past_fails() {
        let mut tl = Timeline::new(0);
        tl.schedule(100, DEFAULT_PRIORITY, probe("a")).unwrap();
        tl.begin_run();
        tl.next_event().unwrap();
        let err = tl.schedule(50, DEFAULT_PRIORITY, probe("b"));
        assert!(matches!(err, Err(crate::SimulationError::Precondition(_))));
    }

    #[test]
    fn test_stop_time_leaves_event_queued() {
        let mut tl = Timeline::new(0);
        tl.schedule(10, DEFAULT_PRIORITY, probe("a")).unwrap();
        tl.schedule(100, DEFAULT_PRIORITY, probe("b")).unwrap();
        tl.set_stop_time(100);
        assert_eq!(drain_nodes(&mut tl), vec!["a"]);
        // The boundary event survives for a later run with a larger stop time
        tl.set_stop_time(SimTime::MAX);
        assert_eq!(drain_nodes(&mut tl), vec!["b"]);
    }

    #[test]
    fn test_derived_rng_is_stable_and_name_dependent() {
        let mut a1 = derive_entity_rng(42, "alice");
        let mut a2 = derive_entity_rng(42, "alice");
        let mut b = derive_entity_rng(42, "bob");
        let x1 = a1.next_u64();
        assert_eq!(x1, a2.next_u64());
        assert_ne!(x1, b.next_u64());
    }

    #[test]
    fn test_precise_delay_has_no_float_drift() {
        // 1 km at 2e8 m/s is exactly 5 us
        assert_eq!(precise_delay_ps(1000.0, 200_000_000), 5_000_000);
        // A non-terminating ratio rounds once, consistently
        assert_eq!(precise_delay_ps(1.0 / 3.0, 200_000_000), 1667);
        // Scaling the length scales the delay without reintroducing drift
        for meters in 1..200u32 {
            let unit = precise_delay_ps(1.0, 200_000_000);
            assert_eq!(precise_delay_ps(f64::from(meters), 200_000_000), u64::from(meters) * unit);
        }
    }

    #[test]
    fn test_precise_period() {
        assert_eq!(precise_period_ps(2e3), 500_000_000);
        assert_eq!(precise_period_ps(80e6), 12_500);
    }

    proptest::proptest! {
        #[test]
        fn prop_derived_rng_depends_only_on_seed_and_name(seed: u64, name in "[a-z]{1,12}") {
            let mut first = derive_entity_rng(seed, &name);
            let mut second = derive_entity_rng(seed, &name);
            proptest::prop_assert_eq!(first.next_u64(), second.next_u64());
        }

        #[test]
        fn prop_integer_delays_never_drift(millimeters in 1u64..10_000_000) {
            // Whatever the span, ten identical computations land on one tick
            let meters = millimeters as f64 / 1e3;
            let reference = precise_delay_ps(meters, 200_000_000);
            for _ in 0..10 {
                proptest::prop_assert_eq!(precise_delay_ps(meters, 200_000_000), reference);
            }
            // And the delay is within one tick of the exact ratio
            let exact = millimeters as f64 * 1e9 / 200_000_000f64;
            proptest::prop_assert!((reference as f64 - exact).abs() <= 1.0);
        }
    }
}
