//! Packet framing and class arbitration.
//!
//! Stamped kinstrs queue up in three traffic classes: reclamation queries,
//! element-ordered traffic, and normal traffic, served in that priority
//! order. The framer batches consecutive same-destination kinstrs into one
//! packet to amortize the header word, and flushes a partial batch when the
//! destination changes, when a query is waiting behind it, or when the
//! batch has sat idle too long. Flushed packets drain onto the outbound
//! channel one 64-bit word per cycle.

use std::collections::VecDeque;

use crate::mesh::MeshTopology;
use crate::packet::{Dest, Header, KinstrOp, MessageKind, SendType, SequencedKinstr};

/// Source row the lamlet reports in packet headers; it sits one row north
/// of kamlet row 0.
pub const LAMLET_Y: u8 = 0xFF;

/// Counters for dispatched traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub packets: u64,
    pub words: u64,
    pub kinstrs: u64,
    pub queries: u64,
}

/// A queued kinstr tagged with its acceptance order, so class priority can
/// never reorder two kinstrs bound for the same target.
#[derive(Debug)]
struct Queued {
    seq: u64,
    instr: SequencedKinstr,
}

#[derive(Debug)]
pub struct DispatchQueue {
    topo: MeshTopology,
    capacity: usize,
    max_batch: usize,
    flush_after: u32,
    next_seq: u64,
    reclaim: VecDeque<SequencedKinstr>,
    ordered: VecDeque<Queued>,
    normal: VecDeque<Queued>,
    batch: Vec<SequencedKinstr>,
    idle_cycles: u32,
    emit: VecDeque<u64>,
    stats: DispatchStats,
}

fn is_query(instr: &SequencedKinstr) -> bool {
    matches!(instr.op, KinstrOp::IdentQuery { .. })
}

/// Two destinations share a target when equal or when either is a
/// broadcast, which reaches every kamlet.
fn dests_overlap(a: Dest, b: Dest) -> bool {
    a == b || a == Dest::Broadcast || b == Dest::Broadcast
}

#[derive(Clone, Copy)]
enum Class {
    Reclaim,
    Ordered,
    Normal,
}

impl DispatchQueue {
    pub fn new(topo: MeshTopology, capacity: usize, max_batch: usize, flush_after: u32) -> Self {
        debug_assert!(capacity >= 1 && max_batch >= 1);
        Self {
            topo,
            capacity,
            max_batch,
            flush_after,
            next_seq: 0,
            reclaim: VecDeque::new(),
            ordered: VecDeque::new(),
            normal: VecDeque::new(),
            batch: Vec::with_capacity(max_batch),
            idle_cycles: 0,
            emit: VecDeque::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Queue a stamped kinstr; false means the buffer is full and the
    /// caller must retry next cycle.
    pub fn push(&mut self, instr: SequencedKinstr) -> bool {
        if self.queued_len() == self.capacity {
            return false;
        }
        self.idle_cycles = 0;
        let seq = self.next_seq;
        self.next_seq += 1;
        if is_query(&instr) {
            self.reclaim.push_back(instr);
        } else if instr.ordered {
            self.ordered.push_back(Queued { seq, instr });
        } else {
            self.normal.push_back(Queued { seq, instr });
        }
        true
    }

    /// True when another kinstr can be queued this cycle.
    pub fn has_room(&self) -> bool {
        self.queued_len() < self.capacity
    }

    /// Kinstrs queued or staged but not yet framed.
    pub fn queued_len(&self) -> usize {
        self.reclaim.len() + self.ordered.len() + self.normal.len() + self.batch.len()
    }

    /// True when nothing is queued, staged, or mid-emission.
    pub fn is_empty(&self) -> bool {
        self.queued_len() == 0 && self.emit.is_empty()
    }

    /// True while a reclamation query has not yet been framed.
    pub fn query_pending(&self) -> bool {
        self.reclaim.iter().chain(self.batch.iter()).any(is_query)
    }

    /// Idents of compute kinstrs that have not yet been framed into a
    /// packet. Used to pick the reclamation baseline.
    pub fn pending_idents(&self) -> impl Iterator<Item = u8> + '_ {
        self.ordered
            .iter()
            .chain(self.normal.iter())
            .map(|q| &q.instr)
            .chain(self.batch.iter())
            .filter(|i| !is_query(i))
            .map(|i| i.ident)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// One cycle of arbitration and emission. Returns the word placed on
    /// the channel, if the channel had room.
    pub fn step(&mut self, channel_ready: bool) -> Option<u64> {
        if self.fill_batch() {
            self.idle_cycles = 0;
        } else if !self.batch.is_empty() {
            self.idle_cycles = self.idle_cycles.saturating_add(1);
        }
        if self.should_flush() {
            self.flush();
        }
        if channel_ready {
            if let Some(word) = self.emit.pop_front() {
                self.stats.words += 1;
                return Some(word);
            }
        }
        None
    }

    /// Stage queue heads into the batch; returns whether anything moved.
    fn fill_batch(&mut self) -> bool {
        let mut moved = false;
        while self.batch.len() < self.max_batch {
            // Queries always travel alone in their own packet.
            if self.batch.first().is_some_and(is_query) {
                break;
            }
            let Some(head) = self.next_candidate() else { break };
            match self.batch.first() {
                None => {}
                Some(first) if first.dest == head.dest && !is_query(head) => {}
                Some(_) => break,
            }
            let instr = self
                .pop_candidate()
                .expect("candidate peeked above");
            self.batch.push(instr);
            moved = true;
        }
        moved
    }

    /// Class the arbitration serves next. Priority is reclaim > ordered >
    /// normal, but an ordered kinstr may not overtake an earlier-accepted
    /// normal kinstr whose destination overlaps its own; same-target
    /// traffic always frames in acceptance order. When the ordered head is
    /// blocked that way, the blocking normal kinstr predates every ordered
    /// entry, so serving the normal queue first cannot itself overtake.
    fn next_class(&self) -> Option<Class> {
        if !self.reclaim.is_empty() {
            return Some(Class::Reclaim);
        }
        if let Some(head) = self.ordered.front() {
            let overtaken = self
                .normal
                .iter()
                .any(|q| q.seq < head.seq && dests_overlap(q.instr.dest, head.instr.dest));
            if !overtaken {
                return Some(Class::Ordered);
            }
        }
        if self.normal.is_empty() {
            None
        } else {
            Some(Class::Normal)
        }
    }

    /// The kinstr arbitration would frame next.
    fn next_candidate(&self) -> Option<&SequencedKinstr> {
        match self.next_class()? {
            Class::Reclaim => self.reclaim.front(),
            Class::Ordered => self.ordered.front().map(|q| &q.instr),
            Class::Normal => self.normal.front().map(|q| &q.instr),
        }
    }

    fn pop_candidate(&mut self) -> Option<SequencedKinstr> {
        match self.next_class()? {
            Class::Reclaim => self.reclaim.pop_front(),
            Class::Ordered => self.ordered.pop_front().map(|q| q.instr),
            Class::Normal => self.normal.pop_front().map(|q| q.instr),
        }
    }

    fn should_flush(&self) -> bool {
        let Some(first) = self.batch.first() else { return false };
        if self.batch.len() == self.max_batch || is_query(first) {
            return true;
        }
        // A waiting query must not starve behind a slow-filling batch.
        if !self.reclaim.is_empty() {
            return true;
        }
        // The batch cannot grow further if the next arbitration pick wants
        // a different destination.
        let blocked = self.next_candidate().is_some_and(|head| head.dest != first.dest);
        blocked || self.idle_cycles >= self.flush_after
    }

    fn flush(&mut self) {
        let dest = self.batch[0].dest;
        let (target_x, target_y, send_type) = match dest {
            Dest::Kamlet(k) => {
                let (x, y) = self.topo.coords(k as usize);
                (x, y, SendType::Single)
            }
            // A broadcast walks the whole mesh; the far corner is the
            // nominal target.
            Dest::Broadcast => {
                let (x, y) = self.topo.coords(self.topo.len() - 1);
                (x, y, SendType::Broadcast)
            }
        };
        let header = Header {
            target_x,
            target_y,
            source_x: 0,
            source_y: LAMLET_Y,
            count: self.batch.len() as u8,
            kind: MessageKind::Instructions,
            send_type,
        };
        log::trace!(
            "framer: flush {} kinstrs to {:?} (target {},{})",
            self.batch.len(),
            dest,
            target_x,
            target_y
        );
        self.emit.push_back(header.encode());
        for instr in self.batch.drain(..) {
            if is_query(&instr) {
                self.stats.queries += 1;
            } else {
                self.stats.kinstrs += 1;
            }
            self.emit.push_back(instr.encode_word());
        }
        self.stats.packets += 1;
        self.idle_cycles = 0;
    }
}
