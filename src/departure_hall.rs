use crate::ship::{Arrival, Departure, ShipState};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Memory cache for departures pending their first send, a retry, or a response.
///
/// Departures are grouped into "fleets" by priority (insertion order preserved within a
///  fleet) and indexed by sequence number for response matching. The index is an owning
///  map with deterministic removal at every exit point - completion, failure and purge -
///  so nothing relies on implicit reclamation. Resolved sequence numbers are remembered
///  for a grace window so duplicate or late acknowledgments are absorbed silently.
pub struct DepartureHall {
    /// ascending, deduplicated; always exactly the priorities with a non-empty fleet
    priority_order: Vec<i32>,
    fleets: FxHashMap<i32, Vec<Departure>>,
    /// sn -> priority of the fleet holding the ship; important non-disposable ships only
    index: FxHashMap<u64, i32>,
    /// sn -> completion time, kept for `finished_retention`
    finished: FxHashMap<u64, Instant>,
    finished_retention: Duration,
}

impl DepartureHall {
    pub fn new(finished_retention: Duration) -> DepartureHall {
        DepartureHall {
            priority_order: Vec::new(),
            fleets: FxHashMap::default(),
            index: FxHashMap::default(),
            finished: FxHashMap::default(),
            finished_retention,
        }
    }

    /// Append an outgoing ship to the fleet matching its priority.
    ///
    /// Returns false if a ship with the same sequence number already sits in that fleet
    ///  (duplicate enqueue - the hall keeps the first copy).
    pub fn append(&mut self, outgo: Departure) -> bool {
        let priority = outgo.priority();
        let fleet = self.fleets.entry(priority).or_default();
        if let Some(sn) = outgo.sn() {
            if fleet.iter().any(|ship| ship.sn() == Some(sn)) {
                debug!("duplicate departure #{} for priority {} - ignoring", sn, priority);
                return false;
            }
        }
        if fleet.is_empty() {
            Self::insert_priority(&mut self.priority_order, priority);
        }
        if let (Some(sn), true) = (outgo.sn(), outgo.is_important()) {
            // disposable ships need no response, so they are never indexed
            self.index.insert(sn, priority);
        }
        trace!("appending departure {:?} with priority {}", outgo.sn(), priority);
        fleet.push(outgo);
        true
    }

    fn insert_priority(priority_order: &mut Vec<i32>, priority: i32) {
        for (pos, &value) in priority_order.iter().enumerate() {
            if value == priority {
                return;
            }
            if value > priority {
                priority_order.insert(pos, priority);
                return;
            }
        }
        priority_order.push(priority);
    }

    /// Match an incoming response against a pending departure. Returns the finished
    ///  task once all its fragments are acknowledged.
    ///
    /// A response for an already-resolved sequence number returns None without touching
    ///  any state - this is what absorbs duplicate and late acknowledgments.
    pub fn check_response(&mut self, response: &Arrival, now: Instant) -> Option<Departure> {
        let sn = response.sn()?;
        if self.finished.contains_key(&sn) {
            trace!("response for already finished departure #{} - absorbing", sn);
            return None;
        }
        let priority = *self.index.get(&sn)?;
        let fleet = self.fleets.get_mut(&priority)?;
        let pos = fleet.iter().position(|ship| ship.sn() == Some(sn))?;
        if !fleet[pos].check_response(response) {
            // some fragments still unacknowledged, keep waiting
            return None;
        }
        let ship = fleet.remove(pos);
        self.drop_fleet_if_empty(priority);
        self.index.remove(&sn);
        self.finished.insert(sn, now);
        debug!("departure #{} finished", sn);
        Some(ship)
    }

    /// Get the next task due for sending: new work always goes first, then timed-out
    ///  retries, in ascending priority order.
    ///
    /// Disposable ships are removed from the hall on retrieval; a FAILED ship found
    ///  during the timeout scan is removed and returned so the caller can report it.
    pub fn next_due(&mut self, now: Instant) -> Option<Departure> {
        if let Some(ship) = self.next_new(now) {
            return Some(ship);
        }
        self.next_timeout(now)
    }

    fn next_new(&mut self, now: Instant) -> Option<Departure> {
        for priority in self.priority_order.clone() {
            let fleet = match self.fleets.get_mut(&priority) {
                Some(fleet) => fleet,
                None => continue,
            };
            let pos = match fleet.iter().position(|ship| ship.state(now) == ShipState::New) {
                Some(pos) => pos,
                None => continue,
            };
            if fleet[pos].is_disposable() {
                // needs no response: hand it out and forget it
                let ship = fleet.remove(pos);
                self.drop_fleet_if_empty(priority);
                if let Some(sn) = ship.sn() {
                    self.index.remove(&sn);
                }
                return Some(ship);
            }
            // first try - stamp the retry clock, keep it in the fleet for the response
            fleet[pos].touch(now);
            return Some(fleet[pos].clone());
        }
        None
    }

    fn next_timeout(&mut self, now: Instant) -> Option<Departure> {
        for priority in self.priority_order.clone() {
            let fleet = match self.fleets.get_mut(&priority) {
                Some(fleet) => fleet,
                None => continue,
            };
            for pos in 0..fleet.len() {
                match fleet[pos].state(now) {
                    ShipState::Timeout => {
                        // stamp the retry and move the ship to the tail so other
                        //  pending ships in this fleet get a turn
                        let mut ship = fleet.remove(pos);
                        ship.touch(now);
                        debug!("departure {:?} timed out, resending (try {})", ship.sn(), ship.tries());
                        fleet.push(ship.clone());
                        return Some(ship);
                    }
                    ShipState::Failed => {
                        let ship = fleet.remove(pos);
                        self.drop_fleet_if_empty(priority);
                        if let Some(sn) = ship.sn() {
                            self.index.remove(&sn);
                        }
                        debug!("departure {:?} failed after {} tries", ship.sn(), ship.tries());
                        return Some(ship);
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Remove finished ships still sitting in fleets, drop empty fleets, and evict
    ///  finished-cache entries older than the retention window. Idempotent.
    pub fn purge(&mut self, now: Instant) {
        for priority in self.priority_order.clone() {
            let fleet = match self.fleets.get_mut(&priority) {
                Some(fleet) => fleet,
                None => continue,
            };
            let mut pos = 0;
            while pos < fleet.len() {
                if fleet[pos].state(now) == ShipState::Done {
                    let ship = fleet.remove(pos);
                    if let Some(sn) = ship.sn() {
                        self.index.remove(&sn);
                        self.finished.insert(sn, now);
                    }
                } else {
                    pos += 1;
                }
            }
            self.drop_fleet_if_empty(priority);
        }

        if let Some(ago) = now.checked_sub(self.finished_retention) {
            self.finished.retain(|_, &mut when| when >= ago);
        }
    }

    fn drop_fleet_if_empty(&mut self, priority: i32) {
        if self.fleets.get(&priority).is_some_and(|fleet| fleet.is_empty()) {
            self.fleets.remove(&priority);
            self.priority_order.retain(|&value| value != priority);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.fleets.values().map(|fleet| fleet.len()).sum()
    }

    #[cfg(test)]
    fn finished_count(&self) -> usize {
        self.finished.len()
    }
}
