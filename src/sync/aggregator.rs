//! Per-node quadrant-wavefront minimum aggregation.
//!
//! Each node partitions the rest of the grid into eight regions, one per
//! direction: the four cardinal regions are the node's own row and column
//! extended outward, the four diagonal regions are the quadrants between
//! them. A message sent toward direction `d` carries the minimum over the
//! sender and all of its regions that lie behind the receiver, so the
//! receiver can record it as its own region-`d` minimum. Once a node holds
//! its local value and all eight regional minima, the minimum of those nine
//! numbers is the global minimum.
//!
//! Sends are gated on prerequisites ([`Direction::prerequisites`]): a
//! diagonal message folds in two cardinal regions and the opposite
//! quadrant, so it cannot go out until those arrive. Regions that fall off
//! the grid edge are pre-synced as empty when a round's entry is allocated,
//! which is what starts the wavefront at the corners.

use smallvec::SmallVec;
use thiserror::Error;

use crate::mesh::{Direction, MeshTopology, ALL_DIRECTIONS};
use crate::sync::wire::SyncMessage;

/// Errors from the aggregation protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync table full: {capacity} aggregation rounds already in flight")]
    AggregationCapacityExceeded { capacity: usize },
    #[error("duplicate {direction:?} report for round {round}")]
    RegionAlreadySynced { round: u8, direction: Direction },
    #[error("local value already recorded for round {round}")]
    LocalValueAlreadySeen { round: u8 },
}

/// In-flight state for one aggregation round.
#[derive(Debug, Clone)]
struct Entry {
    round: u8,
    local_value: Option<u8>,
    /// Regional minimum per direction. `None` with `synced` set means the
    /// region is empty (off the grid edge).
    group_value: [Option<u8>; 8],
    group_synced: [bool; 8],
    forwarded: [bool; 8],
}

impl Entry {
    fn region_min(&self, dirs: &[Direction]) -> Option<u8> {
        dirs.iter().filter_map(|d| self.group_value[d.index()]).min()
    }
}

/// Aggregation state machine for one node of the mesh.
///
/// Multiple rounds may be in flight when a fast neighbor starts round N+1
/// before a slow one has finished round N; the table holds each round's
/// state independently, bounded by `capacity`.
#[derive(Debug)]
pub struct SyncAggregator {
    topo: MeshTopology,
    x: u8,
    y: u8,
    capacity: usize,
    entries: SmallVec<[Entry; 4]>,
}

impl SyncAggregator {
    pub fn new(topo: MeshTopology, x: u8, y: u8, capacity: usize) -> Self {
        Self { topo, x, y, capacity, entries: SmallVec::new() }
    }

    /// Record this node's own value for `round`.
    pub fn local_event(&mut self, round: u8, value: u8) -> Result<(), SyncError> {
        let idx = self.entry_index(round)?;
        let entry = &mut self.entries[idx];
        if entry.local_value.is_some() {
            return Err(SyncError::LocalValueAlreadySeen { round });
        }
        log::trace!("sync ({},{}): round {} local value {}", self.x, self.y, round, value);
        entry.local_value = Some(value);
        Ok(())
    }

    /// Record a neighbor's report. `from` is the direction the message
    /// arrived from, which is the region it summarizes.
    pub fn receive(&mut self, from: Direction, msg: SyncMessage) -> Result<(), SyncError> {
        let idx = self.entry_index(msg.round)?;
        let entry = &mut self.entries[idx];
        if entry.group_synced[from.index()] {
            return Err(SyncError::RegionAlreadySynced { round: msg.round, direction: from });
        }
        log::trace!(
            "sync ({},{}): round {} region {:?} value {}",
            self.x,
            self.y,
            msg.round,
            from,
            msg.value
        );
        entry.group_synced[from.index()] = true;
        entry.group_value[from.index()] = Some(msg.value);
        Ok(())
    }

    /// Collect every message that is now ready to go out, at most one per
    /// direction per round. A send toward `d` requires the local value and
    /// the regional minima behind this node relative to `d`.
    pub fn poll_sends(&mut self) -> SmallVec<[(Direction, SyncMessage); 8]> {
        let mut out = SmallVec::new();
        for entry in self.entries.iter_mut() {
            let Some(local) = entry.local_value else { continue };
            for dir in ALL_DIRECTIONS {
                if entry.forwarded[dir.index()] {
                    continue;
                }
                let prereqs = dir.prerequisites();
                if !prereqs.iter().all(|p| entry.group_synced[p.index()]) {
                    continue;
                }
                let value = match entry.region_min(prereqs) {
                    Some(region) => local.min(region),
                    None => local,
                };
                entry.forwarded[dir.index()] = true;
                out.push((dir, SyncMessage { round: entry.round, value }));
            }
        }
        out
    }

    /// True once `round` holds its local value and all eight regions, and
    /// every outgoing report has been handed off. The send condition keeps a
    /// node from retiring a round while a neighbor still depends on it.
    pub fn is_complete(&self, round: u8) -> bool {
        self.entries.iter().find(|e| e.round == round).is_some_and(|e| {
            e.local_value.is_some()
                && e.group_synced.iter().all(|&s| s)
                && e.forwarded.iter().all(|&f| f)
        })
    }

    /// Consume a completed round, returning the global minimum and freeing
    /// its table slot.
    pub fn take_completion(&mut self, round: u8) -> Option<u8> {
        let idx = self.entries.iter().position(|e| e.round == round)?;
        if !self.is_complete(round) {
            return None;
        }
        let entry = self.entries.remove(idx);
        let local = entry.local_value?;
        let result = match entry.region_min(&ALL_DIRECTIONS) {
            Some(region) => local.min(region),
            None => local,
        };
        log::debug!("sync ({},{}): round {} complete, min {}", self.x, self.y, round, result);
        Some(result)
    }

    /// Number of rounds currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// Find or allocate the entry for `round`, pre-syncing off-grid regions.
    fn entry_index(&mut self, round: u8) -> Result<usize, SyncError> {
        if let Some(idx) = self.entries.iter().position(|e| e.round == round) {
            return Ok(idx);
        }
        if self.entries.len() == self.capacity {
            return Err(SyncError::AggregationCapacityExceeded { capacity: self.capacity });
        }
        let mut entry = Entry {
            round,
            local_value: None,
            group_value: [None; 8],
            group_synced: [false; 8],
            forwarded: [false; 8],
        };
        for dir in ALL_DIRECTIONS {
            if !self.topo.has_neighbor(self.x, self.y, dir) {
                entry.group_synced[dir.index()] = true;
                entry.forwarded[dir.index()] = true;
            }
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_node() -> SyncAggregator {
        SyncAggregator::new(MeshTopology::new(1, 1), 0, 0, 4)
    }

    fn grid(topo: MeshTopology) -> Vec<SyncAggregator> {
        (0..topo.len())
            .map(|i| {
                let (x, y) = topo.coords(i);
                SyncAggregator::new(topo, x, y, 4)
            })
            .collect()
    }

    /// Shuttle sync messages between neighbors until no node has anything
    /// left to send.
    fn shuttle_until_quiet(topo: MeshTopology, aggs: &mut [SyncAggregator]) {
        loop {
            let mut moved = false;
            for i in 0..aggs.len() {
                let (x, y) = topo.coords(i);
                let sends = aggs[i].poll_sends();
                for (dir, msg) in sends {
                    let (nx, ny) = topo.neighbor(x, y, dir).expect("send has a neighbor");
                    aggs[topo.index(nx, ny)].receive(dir.opposite(), msg).unwrap();
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn test_single_node_completes_on_local_value() {
        let mut agg = single_node();
        agg.local_event(0, 42).unwrap();
        assert!(agg.is_complete(0));
        assert_eq!(agg.take_completion(0), Some(42));
        assert_eq!(agg.in_flight(), 0);
    }

    #[test]
    fn test_duplicate_local_value_rejected() {
        let mut agg = single_node();
        agg.local_event(0, 1).unwrap();
        assert_eq!(agg.local_event(0, 2), Err(SyncError::LocalValueAlreadySeen { round: 0 }));
    }

    #[test]
    fn test_duplicate_region_rejected() {
        let topo = MeshTopology::new(2, 1);
        let mut agg = SyncAggregator::new(topo, 0, 0, 4);
        let msg = SyncMessage { round: 0, value: 5 };
        agg.receive(Direction::East, msg).unwrap();
        assert_eq!(
            agg.receive(Direction::East, msg),
            Err(SyncError::RegionAlreadySynced { round: 0, direction: Direction::East })
        );
    }

    #[test]
    fn test_table_capacity() {
        let mut agg = SyncAggregator::new(MeshTopology::new(1, 1), 0, 0, 2);
        agg.local_event(0, 1).unwrap();
        agg.local_event(1, 1).unwrap();
        assert_eq!(
            agg.local_event(2, 1),
            Err(SyncError::AggregationCapacityExceeded { capacity: 2 })
        );
    }

    #[test]
    fn test_diagonal_send_waits_for_prerequisites() {
        // Center node of a 3x3 grid: the NorthEast send needs the SouthWest
        // quadrant and the South and West cardinals before it can go out.
        let topo = MeshTopology::new(3, 3);
        let mut agg = SyncAggregator::new(topo, 1, 1, 4);
        agg.local_event(0, 10).unwrap();
        assert!(agg.poll_sends().iter().all(|(d, _)| !d.is_diagonal()));

        agg.receive(Direction::South, SyncMessage { round: 0, value: 7 }).unwrap();
        agg.receive(Direction::West, SyncMessage { round: 0, value: 9 }).unwrap();
        assert!(!agg.poll_sends().iter().any(|(d, _)| *d == Direction::NorthEast));

        agg.receive(Direction::SouthWest, SyncMessage { round: 0, value: 3 }).unwrap();
        let sends = agg.poll_sends();
        let (_, msg) = sends
            .iter()
            .find(|(d, _)| *d == Direction::NorthEast)
            .expect("NorthEast send ready");
        assert_eq!(msg.value, 3);
    }

    #[test]
    fn test_full_mesh_converges_on_global_min() {
        // Drive a complete 3x3 exchange by hand: every node gets a distinct
        // local value, messages are shuttled until quiescent, and every node
        // must complete with the global minimum.
        let topo = MeshTopology::new(3, 3);
        let mut aggs = grid(topo);
        for (i, agg) in aggs.iter_mut().enumerate() {
            agg.local_event(0, 20 + i as u8).unwrap();
        }
        shuttle_until_quiet(topo, &mut aggs);

        for (i, agg) in aggs.iter_mut().enumerate() {
            assert!(agg.is_complete(0), "node {} incomplete", i);
            assert_eq!(agg.take_completion(0), Some(20));
        }
    }

    #[test]
    fn test_two_by_two_converges_on_global_min() {
        // No interior nodes: every node sits on an edge and pre-syncs most
        // regions. The minimum sits at the far corner from the origin.
        let topo = MeshTopology::new(2, 2);
        let mut aggs = grid(topo);
        for (i, &value) in [9u8, 5, 7, 3].iter().enumerate() {
            aggs[i].local_event(0, value).unwrap();
        }
        shuttle_until_quiet(topo, &mut aggs);

        for (i, agg) in aggs.iter_mut().enumerate() {
            assert!(agg.is_complete(0), "node {} incomplete", i);
            assert_eq!(agg.take_completion(0), Some(3));
        }
    }

    #[test]
    fn test_interleaved_rounds_stay_separate() {
        let mut agg = single_node();
        agg.local_event(3, 8).unwrap();
        agg.local_event(4, 2).unwrap();
        assert_eq!(agg.in_flight(), 2);
        assert_eq!(agg.take_completion(4), Some(2));
        assert_eq!(agg.take_completion(3), Some(8));
    }
}
