//! # Network Manager
//!
//! Two layers on every router:
//!
//! - **Reservation protocol** (control): computes the quantum path through the
//!   forwarding table, reserves memory capacity hop-by-hop against per-memory
//!   timecards, unwinds on rejection, and installs the generation /
//!   purification / swapping rules each hop needs on approval.
//! - **Routing and forwarding** (split roles): routing writes the forwarding
//!   table, forwarding reads it. The default routing protocol is static
//!   shortest-path by length with alphabetical tie-breaks; a distance-vector
//!   variant advertises link state over classical channels and recomputes on
//!   change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::kernel::{Process, SimTime};
use crate::messages::{MessageKind, ReservationMsg, RoutingMsg};
use crate::resource_manager::{self, EgArgs, EpArgs, EsAArgs, EsBArgs, Rule, RuleKind};
use crate::simulation::Simulation;
use crate::{Result, SimulationError};

/// Network-wide reservation identity: the initiating node plus its serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId {
    pub initiator: String,
    pub serial: u64,
}

/// A path-scoped, time-bounded allocation of memory capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub responder: String,
    pub start_time: SimTime,
    pub end_time: SimTime,
    pub memory_size: usize,
    pub target_fidelity: f64,
}

impl Reservation {
    pub fn initiator(&self) -> &str {
        &self.id.initiator
    }
}

/// Reservation windows booked against one physical memory slot.
#[derive(Debug, Clone, Default)]
pub struct TimeCard {
    pub reservations: Vec<Reservation>,
}

impl TimeCard {
    /// Whether a window would overlap an existing booking.
    pub fn conflicts(&self, start: SimTime, end: SimTime) -> bool {
        self.reservations
            .iter()
            .any(|r| r.start_time < end && start < r.end_time)
    }

    pub fn add(&mut self, reservation: Reservation) -> bool {
        if self.conflicts(reservation.start_time, reservation.end_time) {
            return false;
        }
        self.reservations.push(reservation);
        self.reservations.sort_by_key(|r| r.start_time);
        true
    }

    pub fn remove(&mut self, id: &ReservationId) -> bool {
        let before = self.reservations.len();
        self.reservations.retain(|r| &r.id != id);
        before != self.reservations.len()
    }

    pub fn holds(&self, id: &ReservationId) -> bool {
        self.reservations.iter().any(|r| &r.id == id)
    }
}

/// The routing role in charge of the forwarding table.
#[derive(Debug, Clone)]
pub enum RoutingKind {
    /// Topology-derived shortest path, computed once at build
    Static,
    /// Distributed distance-vector recomputation on link-state advertisements
    DistanceVector {
        distances: HashMap<String, (u64, String)>,
    },
}

impl Default for RoutingKind {
    fn default() -> Self {
        RoutingKind::Static
    }
}


/// Per-node network manager state.
#[derive(Debug, Default)]
pub struct NetworkManager {
    /// destination node name -> next-hop node name
    pub forwarding: HashMap<String, String>,
    /// Router-level neighbors with link costs (one-way delay in ps)
    pub neighbors: Vec<(String, u64)>,
    /// neighbor router -> middle herald node on that link
    pub mids: HashMap<String, String>,
    pub timecards: Vec<TimeCard>,
    pub routing: RoutingKind,
    serial: u64,
    reserved_indexes: HashMap<ReservationId, Vec<usize>>,
    /// Rules computed at approval, installed when the window opens
    staged: HashMap<ReservationId, Vec<Rule>>,
}

impl NetworkManager {
    pub fn next_serial(&mut self) -> u64 {
        let serial = self.serial;
        self.serial += 1;
        serial
    }

    pub fn next_hop(&self, destination: &str) -> Option<&str> {
        self.forwarding.get(destination).map(String::as_str)
    }

    pub fn reserved_indexes(&self, id: &ReservationId) -> Option<&[usize]> {
        self.reserved_indexes.get(id).map(Vec::as_slice)
    }

    /// Book `count` conflict-free memory slots for the window, or none.
    fn reserve(&mut self, reservation: &Reservation, count: usize) -> Option<Vec<usize>> {
        let free: Vec<usize> = self
            .timecards
            .iter()
            .enumerate()
            .filter(|(_, card)| !card.conflicts(reservation.start_time, reservation.end_time))
            .map(|(index, _)| index)
            .take(count)
            .collect();
        if free.len() < count {
            return None;
        }
        for &index in &free {
            self.timecards[index].add(reservation.clone());
        }
        self.reserved_indexes.insert(reservation.id.clone(), free.clone());
        Some(free)
    }

    fn release(&mut self, id: &ReservationId) {
        for card in &mut self.timecards {
            card.remove(id);
        }
        self.reserved_indexes.remove(id);
        self.staged.remove(id);
    }
}

/// Initiate a reservation from `node_name` toward `responder`.
///
/// The request travels hop-by-hop along the forwarding tables; the caller's
/// application eventually receives `get_reserve_res(reservation, accepted)`.
pub fn request(
    sim: &mut Simulation,
    node_name: &str,
    responder: &str,
    start_time: SimTime,
    end_time: SimTime,
    memory_size: usize,
    target_fidelity: f64,
) -> Result<()> {
    if node_name == responder {
        return Err(SimulationError::Precondition(
            "reservation initiator and responder must differ".to_string(),
        ));
    }
    if end_time <= start_time {
        return Err(SimulationError::Precondition(
            "reservation window is empty".to_string(),
        ));
    }
    let serial = sim.node_mut(node_name)?.network_manager.next_serial();
    let reservation = Reservation {
        id: ReservationId {
            initiator: node_name.to_string(),
            serial,
        },
        responder: responder.to_string(),
        start_time,
        end_time,
        memory_size,
        target_fidelity,
    };
    info!(
        initiator = node_name,
        responder,
        memory_size,
        target_fidelity,
        "reservation requested"
    );
    process_request(sim, node_name, reservation, Vec::new())
}

/// Handle reservation traffic addressed to this node.
pub fn handle_reservation(
    sim: &mut Simulation,
    node_name: &str,
    _src: &str,
    msg: ReservationMsg,
) -> Result<()> {
    match msg {
        ReservationMsg::Request { reservation, qcaps } => {
            process_request(sim, node_name, reservation, qcaps)
        }
        ReservationMsg::Approve { reservation, path } => {
            process_approve(sim, node_name, reservation, path)
        }
        ReservationMsg::Reject { reservation, path } => {
            process_reject(sim, node_name, reservation, path)
        }
    }
}

fn process_request(
    sim: &mut Simulation,
    node_name: &str,
    reservation: Reservation,
    mut qcaps: Vec<String>,
) -> Result<()> {
    let is_initiator = reservation.initiator() == node_name;
    let is_responder = reservation.responder == node_name;
    // End nodes entangle in one direction, intermediates in both
    let count = if is_initiator || is_responder {
        reservation.memory_size
    } else {
        2 * reservation.memory_size
    };
    let reserved = sim
        .node_mut(node_name)?
        .network_manager
        .reserve(&reservation, count);
    if reserved.is_none() {
        warn!(
            node = node_name,
            initiator = reservation.initiator(),
            "reservation rejected: insufficient free memory windows"
        );
        if is_initiator {
            return deliver_reserve_result(sim, node_name, &reservation, false);
        }
        let previous = qcaps.last().cloned().ok_or_else(|| {
            SimulationError::Protocol("reservation request without traversed hops".to_string())
        })?;
        return sim.send_message(
            node_name,
            &previous,
            MessageKind::Reservation(ReservationMsg::Reject {
                reservation,
                path: qcaps,
            }),
        );
    }
    qcaps.push(node_name.to_string());

    if is_responder {
        let path = qcaps;
        stage_rules(sim, node_name, &reservation, &path)?;
        let previous = path[path.len() - 2].clone();
        return sim.send_message(
            node_name,
            &previous,
            MessageKind::Reservation(ReservationMsg::Approve { reservation, path }),
        );
    }

    let next = sim
        .node(node_name)?
        .network_manager
        .next_hop(&reservation.responder)
        .map(str::to_string)
        .ok_or_else(|| {
            SimulationError::Routing(format!(
                "{node_name} has no forwarding entry for {}",
                reservation.responder
            ))
        })?;
    sim.send_message(
        node_name,
        &next,
        MessageKind::Reservation(ReservationMsg::Request { reservation, qcaps }),
    )
}

fn process_approve(
    sim: &mut Simulation,
    node_name: &str,
    reservation: Reservation,
    path: Vec<String>,
) -> Result<()> {
    stage_rules(sim, node_name, &reservation, &path)?;
    let position = path
        .iter()
        .position(|hop| hop == node_name)
        .ok_or_else(|| SimulationError::Protocol("approve path misses this hop".to_string()))?;
    if position == 0 {
        info!(
            initiator = node_name,
            responder = %reservation.responder,
            "reservation approved end-to-end"
        );
        return deliver_reserve_result(sim, node_name, &reservation, true);
    }
    let previous = path[position - 1].clone();
    sim.send_message(
        node_name,
        &previous,
        MessageKind::Reservation(ReservationMsg::Approve { reservation, path }),
    )
}

fn process_reject(
    sim: &mut Simulation,
    node_name: &str,
    reservation: Reservation,
    path: Vec<String>,
) -> Result<()> {
    sim.node_mut(node_name)?
        .network_manager
        .release(&reservation.id);
    let position = path.iter().position(|hop| hop == node_name);
    match position {
        Some(0) | None => deliver_reserve_result(sim, node_name, &reservation, false),
        Some(position) => {
            let previous = path[position - 1].clone();
            sim.send_message(
                node_name,
                &previous,
                MessageKind::Reservation(ReservationMsg::Reject { reservation, path }),
            )
        }
    }
}

fn deliver_reserve_result(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &Reservation,
    accepted: bool,
) -> Result<()> {
    let mut app = match sim.node_mut(node_name)?.app.take() {
        Some(app) => app,
        None => return Ok(()),
    };
    app.get_reserve_res(reservation, accepted);
    sim.node_mut(node_name)?.app = Some(app);
    Ok(())
}

/// Recursive path bisection: the middle node of each segment swaps that
/// segment's endpoints. Deterministic for every path.
pub fn swap_assignments(path: &[String]) -> HashMap<String, (String, String)> {
    fn recurse(path: &[String], out: &mut HashMap<String, (String, String)>) {
        if path.len() <= 2 {
            return;
        }
        let mid = path.len() / 2;
        out.insert(
            path[mid].clone(),
            (path[0].clone(), path[path.len() - 1].clone()),
        );
        recurse(&path[..=mid], out);
        recurse(&path[mid..], out);
    }
    let mut out = HashMap::new();
    recurse(path, &mut out);
    out
}

/// Derive this hop's rules from its position in the path, stage them, and
/// schedule their installation window.
fn stage_rules(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &Reservation,
    path: &[String],
) -> Result<()> {
    let position = path
        .iter()
        .position(|hop| hop == node_name)
        .ok_or_else(|| SimulationError::Protocol("rule staging off-path".to_string()))?;
    let indexes = sim
        .node(node_name)?
        .network_manager
        .reserved_indexes(&reservation.id)
        .map(<[usize]>::to_vec)
        .ok_or_else(|| {
            SimulationError::Protocol("rule staging without reserved memories".to_string())
        })?;

    let mut rules: Vec<Rule> = Vec::new();
    let mut push_rule = |sim: &mut Simulation, priority: u32, kind: RuleKind| {
        rules.push(Rule {
            id: sim.next_rule_id(),
            priority,
            reservation: reservation.id.clone(),
            kind,
        });
    };

    // Generation toward each path neighbor; intermediates split their bank
    let mut generation_targets: Vec<(String, Vec<usize>)> = Vec::new();
    if position == 0 {
        generation_targets.push((path[1].clone(), indexes.clone()));
    } else if position == path.len() - 1 {
        generation_targets.push((path[position - 1].clone(), indexes.clone()));
    } else {
        let half = indexes.len() / 2;
        generation_targets.push((path[position - 1].clone(), indexes[..half].to_vec()));
        generation_targets.push((path[position + 1].clone(), indexes[half..].to_vec()));
    }
    for (neighbor, slot_indexes) in generation_targets {
        let mid = sim
            .node(node_name)?
            .network_manager
            .mids
            .get(&neighbor)
            .cloned()
            .ok_or_else(|| {
                SimulationError::Configuration(format!(
                    "no herald node between {node_name} and {neighbor}"
                ))
            })?;
        let primary = node_name < neighbor.as_str();
        push_rule(
            sim,
            10,
            RuleKind::EgRule(EgArgs {
                mid,
                neighbor,
                indexes: slot_indexes,
                primary,
            }),
        );
    }

    push_rule(
        sim,
        2,
        RuleKind::EpRule(EpArgs {
            target_fidelity: reservation.target_fidelity,
        }),
    );

    let assignments = swap_assignments(path);
    let own_assignment = assignments.get(node_name).cloned();
    if let Some((left, right)) = own_assignment.clone() {
        push_rule(
            sim,
            0,
            RuleKind::EsRuleA(EsAArgs {
                left,
                right,
                target_fidelity: reservation.target_fidelity,
            }),
        );
    }
    let intermediates = &path[1..path.len() - 1];
    let swappers: Vec<String> = intermediates
        .iter()
        .filter(|hop| hop.as_str() != node_name)
        .filter(|hop| match &own_assignment {
            Some((left, right)) => hop.as_str() != left && hop.as_str() != right,
            None => true,
        })
        .cloned()
        .collect();
    if !swappers.is_empty() {
        push_rule(
            sim,
            1,
            RuleKind::EsRuleB(EsBArgs {
                swappers,
                target_fidelity: reservation.target_fidelity,
            }),
        );
    }

    debug!(
        node = node_name,
        position,
        rules = rules.len(),
        "reservation rules staged"
    );
    let now = sim.timeline.now();
    sim.node_mut(node_name)?
        .network_manager
        .staged
        .insert(reservation.id.clone(), rules);
    sim.timeline.schedule(
        reservation.start_time.max(now),
        crate::kernel::DEFAULT_PRIORITY,
        Process::InstallRules {
            node: node_name.to_string(),
            reservation: reservation.id.clone(),
        },
    )?;
    sim.timeline.schedule(
        reservation.end_time.max(now),
        crate::kernel::DEFAULT_PRIORITY,
        Process::ExpireRules {
            node: node_name.to_string(),
            reservation: reservation.id.clone(),
        },
    )?;
    Ok(())
}

/// Dispatch target of `Process::InstallRules`: the reservation window opened.
pub fn install_reservation(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &ReservationId,
) -> Result<()> {
    let indexes = sim
        .node(node_name)?
        .network_manager
        .reserved_indexes(reservation)
        .map(<[usize]>::to_vec)
        .unwrap_or_default();
    resource_manager::stamp_reservation(sim, node_name, reservation, &indexes)?;
    let rules = sim
        .node_mut(node_name)?
        .network_manager
        .staged
        .remove(reservation)
        .unwrap_or_default();
    debug!(node = node_name, rules = rules.len(), "reservation window opened");
    for rule in rules {
        resource_manager::install_rule(sim, node_name, rule)?;
    }
    Ok(())
}

/// Dispatch target of `Process::ExpireRules`: the reservation window closed.
pub fn expire_reservation(
    sim: &mut Simulation,
    node_name: &str,
    reservation: &ReservationId,
) -> Result<()> {
    resource_manager::expire_rules_by_reservation(sim, node_name, reservation)?;
    sim.node_mut(node_name)?.network_manager.release(reservation);
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Static shortest-path forwarding tables over the router-level graph.
///
/// Ties in path length break on alphabetical node name so that
/// `path(src, dst)` equals `reverse(path(dst, src))`.
pub fn static_forwarding(
    adjacency: &HashMap<String, Vec<(String, u64)>>,
) -> HashMap<String, HashMap<String, String>> {
    let mut tables = HashMap::new();
    let mut names: Vec<&String> = adjacency.keys().collect();
    names.sort();
    for source in &names {
        let mut dist: HashMap<&str, u64> = HashMap::new();
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut heap = std::collections::BinaryHeap::new();
        dist.insert(source.as_str(), 0);
        heap.push(std::cmp::Reverse((0u64, source.as_str())));
        while let Some(std::cmp::Reverse((cost, here))) = heap.pop() {
            if dist.get(here).copied().unwrap_or(u64::MAX) < cost {
                continue;
            }
            let Some(edges) = adjacency.get(here) else { continue };
            for (next, weight) in edges {
                let candidate = cost + weight;
                let best = dist.get(next.as_str()).copied().unwrap_or(u64::MAX);
                let better = candidate < best
                    || (candidate == best
                        && prev
                            .get(next.as_str())
                            .is_some_and(|existing| here < *existing));
                if better {
                    dist.insert(next.as_str(), candidate);
                    prev.insert(next.as_str(), here);
                    heap.push(std::cmp::Reverse((candidate, next.as_str())));
                }
            }
        }
        // Walk predecessors back to find the first hop toward each target
        let mut table = HashMap::new();
        for target in &names {
            if target == source || !prev.contains_key(target.as_str()) {
                continue;
            }
            let mut hop = target.as_str();
            while let Some(&p) = prev.get(hop) {
                if p == source.as_str() {
                    break;
                }
                hop = p;
            }
            table.insert((*target).clone(), hop.to_string());
        }
        tables.insert((*source).clone(), table);
    }
    tables
}

/// Kick off distance-vector advertisements from every participating router.
pub fn start_distance_vector(sim: &mut Simulation, node_name: &str) -> Result<()> {
    let (neighbors, advertisement) = {
        let node = sim.node_mut(node_name)?;
        let nm = &mut node.network_manager;
        let mut distances = HashMap::new();
        distances.insert(node_name.to_string(), (0u64, node_name.to_string()));
        for (neighbor, cost) in nm.neighbors.clone() {
            distances.insert(neighbor.clone(), (cost, neighbor.clone()));
            nm.forwarding.insert(neighbor.clone(), neighbor);
        }
        let advertisement: Vec<(String, u64)> = distances
            .iter()
            .map(|(dst, (cost, _))| (dst.clone(), *cost))
            .collect();
        nm.routing = RoutingKind::DistanceVector { distances };
        (nm.neighbors.clone(), advertisement)
    };
    for (neighbor, _) in neighbors {
        sim.send_message(
            node_name,
            &neighbor,
            MessageKind::Routing(RoutingMsg::DistanceVector {
                origin: node_name.to_string(),
                distances: advertisement.clone(),
            }),
        )?;
    }
    Ok(())
}

/// Handle a distance-vector advertisement; re-advertise on change.
pub fn handle_routing(
    sim: &mut Simulation,
    node_name: &str,
    _src: &str,
    msg: RoutingMsg,
) -> Result<()> {
    let RoutingMsg::DistanceVector { origin, distances } = msg;
    let (changed, neighbors, advertisement) = {
        let node = sim.node_mut(node_name)?;
        let nm = &mut node.network_manager;
        let link_cost = match nm.neighbors.iter().find(|(n, _)| *n == origin) {
            Some((_, cost)) => *cost,
            None => return Ok(()),
        };
        let RoutingKind::DistanceVector { distances: table } = &mut nm.routing else {
            return Ok(());
        };
        let mut changed = false;
        for (destination, cost) in distances {
            if destination == node_name {
                continue;
            }
            let candidate = cost.saturating_add(link_cost);
            let better = match table.get(&destination) {
                None => true,
                Some((best, next)) => {
                    candidate < *best || (candidate == *best && origin.as_str() < next.as_str())
                }
            };
            if better {
                table.insert(destination.clone(), (candidate, origin.clone()));
                nm.forwarding.insert(destination, origin.clone());
                changed = true;
            }
        }
        let advertisement: Vec<(String, u64)> = table
            .iter()
            .map(|(dst, (cost, _))| (dst.clone(), *cost))
            .collect();
        (changed, nm.neighbors.clone(), advertisement)
    };
    if changed {
        for (neighbor, _) in neighbors {
            sim.send_message(
                node_name,
                &neighbor,
                MessageKind::Routing(RoutingMsg::DistanceVector {
                    origin: node_name.to_string(),
                    distances: advertisement.clone(),
                }),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(serial: u64, start: SimTime, end: SimTime) -> Reservation {
        Reservation {
            id: ReservationId {
                initiator: "r1".to_string(),
                serial,
            },
            responder: "r3".to_string(),
            start_time: start,
            end_time: end,
            memory_size: 1,
            target_fidelity: 0.9,
        }
    }

    #[test]
    fn test_timecard_rejects_overlap() {
        let mut card = TimeCard::default();
        assert!(card.add(reservation(0, 100, 200)));
        assert!(!card.add(reservation(1, 150, 250)));
        assert!(card.add(reservation(2, 200, 300)));
        assert!(card.holds(&ReservationId {
            initiator: "r1".to_string(),
            serial: 0
        }));
    }

    #[test]
    fn test_timecard_remove() {
        let mut card = TimeCard::default();
        assert!(card.add(reservation(0, 100, 200)));
        let id = ReservationId {
            initiator: "r1".to_string(),
            serial: 0,
        };
        assert!(card.remove(&id));
        assert!(!card.holds(&id));
        assert!(card.add(reservation(1, 100, 200)));
    }

    #[test]
    fn test_swap_assignments_three_hop() {
        let path: Vec<String> = ["r1", "r2", "r3"].iter().map(|s| s.to_string()).collect();
        let out = swap_assignments(&path);
        assert_eq!(out.len(), 1);
        assert_eq!(out["r2"], ("r1".to_string(), "r3".to_string()));
    }

    #[test]
    fn test_swap_assignments_five_hop_bisects() {
        let path: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let out = swap_assignments(&path);
        assert_eq!(out["c"], ("a".to_string(), "e".to_string()));
        assert_eq!(out["b"], ("a".to_string(), "c".to_string()));
        assert_eq!(out["d"], ("c".to_string(), "e".to_string()));
    }

    #[test]
    fn test_static_forwarding_line() {
        let mut adjacency = HashMap::new();
        adjacency.insert("a".to_string(), vec![("b".to_string(), 1)]);
        adjacency.insert(
            "b".to_string(),
            vec![("a".to_string(), 1), ("c".to_string(), 1)],
        );
        adjacency.insert("c".to_string(), vec![("b".to_string(), 1)]);
        let tables = static_forwarding(&adjacency);
        assert_eq!(tables["a"]["c"], "b");
        assert_eq!(tables["a"]["b"], "b");
        assert_eq!(tables["c"]["a"], "b");
    }

    #[test]
    fn test_static_forwarding_symmetric_paths() {
        // Square with equal weights: a-b-d and a-c-d tie; alphabetical
        // tie-break must make the two directions mirror each other.
        let mut adjacency = HashMap::new();
        adjacency.insert(
            "a".to_string(),
            vec![("b".to_string(), 5), ("c".to_string(), 5)],
        );
        adjacency.insert(
            "b".to_string(),
            vec![("a".to_string(), 5), ("d".to_string(), 5)],
        );
        adjacency.insert(
            "c".to_string(),
            vec![("a".to_string(), 5), ("d".to_string(), 5)],
        );
        adjacency.insert(
            "d".to_string(),
            vec![("b".to_string(), 5), ("c".to_string(), 5)],
        );
        let tables = static_forwarding(&adjacency);
        // Forward path a -> d and reverse path d -> a pick the same middle
        assert_eq!(tables["a"]["d"], "b");
        assert_eq!(tables["d"]["a"], "b");
    }
}
