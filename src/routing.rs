//! Neighbour/routing table: per-neighbour queue log, forwardable flag, and
//! hop count, plus next-hop selection.

use heapless::Vec;

use crate::address::NodeAddr;
use crate::weight::Weight;

/// Forwardable marker meaning "bidirectional-link child" in DAG mode;
/// excluded from the forwardable ticker's decay.
pub const FORWARDABLE_CHILD: i16 = 250;

/// Forwardable value set on a neighbour a node just forwarded data
/// through, so it isn't immediately re-selected (loop avoidance).
const FORWARDABLE_BLOCKED: i16 = 11;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RoutingEntry {
    pub neighbor: NodeAddr,
    pub backpressure: u16,
    pub forwardable: i16,
    pub hop_count: u16,
}

impl RoutingEntry {
    fn new(neighbor: NodeAddr) -> Self {
        Self {
            neighbor,
            backpressure: 0,
            forwardable: 1,
            hop_count: 0,
        }
    }
}

/// Selects which routing-table semantics `find_routing` and the
/// forwardable ticker use.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RoutingMode {
    /// Plain backpressure: any entry may be chosen as next hop.
    Basic,
    /// Hop-count-based parent set: only entries with `forwardable == 1`
    /// are eligible, `250` marks a committed child.
    Dag,
}

pub struct RoutingTable {
    entries: Vec<RoutingEntry, heapless::consts::U64>,
    capacity: usize,
    mode: RoutingMode,
}

impl RoutingTable {
    pub fn new(capacity: usize, mode: RoutingMode) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, addr: NodeAddr) -> Option<&RoutingEntry> {
        self.entries.iter().find(|e| e.neighbor == addr)
    }

    fn find_mut(&mut self, addr: NodeAddr) -> Option<&mut RoutingEntry> {
        self.entries.iter_mut().find(|e| e.neighbor == addr)
    }

    /// Create-or-update a neighbour's advertised queue length. `is_data`
    /// marks this update as having arrived alongside a forwarded data
    /// item, which blocks the neighbour from being selected as next hop
    /// for `forward_block_slots` slots (loop avoidance).
    pub fn update_queuelog(
        &mut self,
        addr: NodeAddr,
        queuelog: u16,
        is_data: bool,
        max_packet_queue_size: u16,
    ) -> Result<(), ()> {
        if self.find(addr).is_none() {
            if self.entries.len() >= self.capacity {
                return Err(());
            }
            self.entries.push(RoutingEntry::new(addr)).map_err(|_| ())?;
        }

        let entry = self.find_mut(addr).unwrap();
        entry.backpressure = queuelog.min(max_packet_queue_size);

        if is_data {
            entry.forwardable = FORWARDABLE_BLOCKED;
        }

        Ok(())
    }

    /// Create-or-update a neighbour's advertised hop count, preserving
    /// `backpressure` when the neighbour is new (set to 0).
    pub fn update_hop_count(&mut self, addr: NodeAddr, hop_count: u16) -> Result<(), ()> {
        if self.find(addr).is_none() {
            if self.entries.len() >= self.capacity {
                return Err(());
            }
            self.entries.push(RoutingEntry::new(addr)).map_err(|_| ())?;
        }
        self.find_mut(addr).unwrap().hop_count = hop_count;
        Ok(())
    }

    /// Best next hop: the entry maximising `weight`. A tie for the best
    /// weight, a non-positive best weight, or (DAG mode) no entry with
    /// `forwardable == 1`, all yield `None`.
    pub fn find_routing<W: Weight>(&self, own_queue_len: u16, estimator: &mut W) -> Option<NodeAddr> {
        let mut best_weight = i32::MIN;
        let mut best: Option<NodeAddr> = None;
        let mut tied = false;

        for e in self.entries.iter() {
            if self.mode == RoutingMode::Dag && e.forwardable != 1 {
                continue;
            }
            let w = estimator.weight(own_queue_len, e);
            if w > best_weight {
                best_weight = w;
                best = Some(e.neighbor);
                tied = false;
            } else if w == best_weight {
                tied = true;
            }
        }

        if best_weight < 1 || tied {
            return None;
        }
        best
    }

    /// The neighbour with the smallest nonzero hop count.
    pub fn find_shortest_path(&self) -> Option<&RoutingEntry> {
        let mut result: Option<&RoutingEntry> = None;
        let mut smallest = u16::MAX;
        for e in self.entries.iter() {
            if e.hop_count != 0 && e.hop_count <= smallest {
                smallest = e.hop_count;
                result = Some(e);
            }
        }
        result
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Mark `addr` as a committed DAG child (excluded from forwarding,
    /// preserved across forwardable ticks). See `RoutingTable::mark_child`
    /// in DESIGN.md for why this is a direct call rather than a wire
    /// handshake.
    pub fn mark_child(&mut self, addr: NodeAddr) {
        if let Some(e) = self.find_mut(addr) {
            e.forwardable = FORWARDABLE_CHILD;
        }
    }

    /// Per-slot forwardable decay (basic mode) or parent reselection (DAG
    /// mode), called once per `SLOT_DURATION`.
    pub fn tick_forwardable(&mut self, num_parents: usize) {
        match self.mode {
            RoutingMode::Basic => self.decay_forwardable(),
            RoutingMode::Dag => self.reselect_parents(num_parents),
        }
    }

    fn decay_forwardable(&mut self) {
        for e in self.entries.iter_mut() {
            if e.forwardable != 1 {
                if e.forwardable < 1 {
                    e.forwardable = 2;
                }
                e.forwardable -= 1;
            }
        }
    }

    fn reselect_parents(&mut self, num_parents: usize) {
        // Children are untouched: bidirectional links aren't allowed.
        for e in self.entries.iter_mut() {
            if e.forwardable != FORWARDABLE_CHILD {
                e.forwardable = 10;
            }
        }

        // Rank non-child entries with a known hop count by smallest hop
        // count first, take the top `num_parents`.
        let mut candidates: Vec<NodeAddr, heapless::consts::U64> = Vec::new();
        for e in self.entries.iter() {
            if e.forwardable != FORWARDABLE_CHILD && e.hop_count != 0 {
                let _ = candidates.push(e.neighbor);
            }
        }
        candidates.sort_unstable_by_key(|addr| self.find(*addr).map(|e| e.hop_count).unwrap_or(u16::MAX));

        for addr in candidates.iter().take(num_parents) {
            if let Some(e) = self.find_mut(*addr) {
                e.forwardable = 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::weight::BasicWeight;

    #[test]
    fn update_queuelog_creates_and_updates() {
        let mut t = RoutingTable::new(4, RoutingMode::Basic);
        t.update_queuelog(NodeAddr(1), 3, false, 70).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.find(NodeAddr(1)).unwrap().backpressure, 3);

        t.update_queuelog(NodeAddr(1), 5, false, 70).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.find(NodeAddr(1)).unwrap().backpressure, 5);
    }

    #[test]
    fn data_arrival_blocks_forwarding_through_sender() {
        let mut t = RoutingTable::new(4, RoutingMode::Basic);
        t.update_queuelog(NodeAddr(1), 3, true, 70).unwrap();
        assert_eq!(t.find(NodeAddr(1)).unwrap().forwardable, FORWARDABLE_BLOCKED);
    }

    #[test]
    fn forwardable_decays_to_one() {
        let mut t = RoutingTable::new(4, RoutingMode::Basic);
        t.update_queuelog(NodeAddr(1), 3, true, 70).unwrap();
        for _ in 0..10 {
            t.tick_forwardable(2);
        }
        assert_eq!(t.find(NodeAddr(1)).unwrap().forwardable, 1);
    }

    #[test]
    fn find_routing_picks_largest_weight() {
        let mut t = RoutingTable::new(4, RoutingMode::Basic);
        t.update_queuelog(NodeAddr(1), 5, false, 70).unwrap();
        t.update_queuelog(NodeAddr(2), 1, false, 70).unwrap();
        let mut w = BasicWeight;
        // own_queue_len = 10: weight(1) = 10-5=5, weight(2) = 10-1=9
        let best = t.find_routing(10, &mut w);
        assert_eq!(best, Some(NodeAddr(2)));
    }

    #[test]
    fn find_routing_empty_table_returns_none() {
        let t = RoutingTable::new(4, RoutingMode::Basic);
        let mut w = BasicWeight;
        assert_eq!(t.find_routing(10, &mut w), None);
    }

    #[test]
    fn dag_mode_requires_forwardable_one() {
        let mut t = RoutingTable::new(4, RoutingMode::Dag);
        t.update_queuelog(NodeAddr(1), 0, false, 70).unwrap();
        // Freshly learned neighbour defaults to forwardable=1 until a
        // tick reclassifies it.
        let mut w = BasicWeight;
        assert_eq!(t.find_routing(10, &mut w), Some(NodeAddr(1)));

        t.mark_child(NodeAddr(1));
        assert_eq!(t.find_routing(10, &mut w), None);
    }
}
