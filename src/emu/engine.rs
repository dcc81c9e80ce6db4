//! The mesh engine: lamlet dispatch wired to stub kamlets.
//!
//! Each cycle advances in a fixed phase order: lamlet dispatch, packet
//! framing, channel delivery, kamlet execution, sync link transfer, and
//! finally response delivery back to the lamlet. The outbound channel
//! carries one 64-bit word per cycle; each sync link carries one 9-bit
//! word per cycle.
//!
//! Kamlets are deliberately simple: an instruction queue drained at a
//! fixed latency per kinstr. That is enough to exercise everything the
//! dispatch core cares about, because the only kamlet behavior it can
//! observe is queue occupancy and reclamation distances.

use std::collections::VecDeque;

use thiserror::Error;

use crate::dispatch::framer::LAMLET_Y;
use crate::dispatch::{DispatchError, DispatchQueue, DispatchStats, IdentTracker, RefreshState};
use crate::mesh::{Direction, MeshTopology, ALL_DIRECTIONS};
use crate::packet::{
    decode_word, DecodedWord, Header, Kinstr, MessageKind, Packet, PacketAssembler, SendType,
};
use crate::params::LamletParams;
use crate::sync::{LinkReassembler, LinkWord, SyncAggregator, SyncError, WireError};

/// Outbound channel double-buffering depth, in words.
const CHANNEL_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("sync: {0}")]
    Sync(#[from] SyncError),
    #[error("sync link: {0}")]
    Wire(#[from] WireError),
    #[error("kamlet ({x},{y}): instruction queue overflow")]
    QueueOverflow { x: u8, y: u8 },
    #[error("lamlet: unexpected {kind:?} packet on response path")]
    UnexpectedPacket { kind: MessageKind },
}

/// Aggregate counters across a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub cycles: u64,
    pub retired: u64,
    pub rounds: u64,
    pub dispatch: DispatchStats,
}

#[derive(Debug, Clone, Copy)]
enum QueueEntry {
    Compute { ident: u8, remaining: u32 },
    Query { round: u8, baseline: u8 },
}

/// A kamlet reduced to what the dispatch core can observe: a bounded
/// instruction queue, an in-flight execution set, and a sync aggregation
/// node. One queue entry issues per cycle; issued kinstrs stay in the
/// execution set for the completion latency.
struct KamletStub {
    x: u8,
    y: u8,
    is_origin: bool,
    modulus: u16,
    depth: u32,
    completion_latency: u32,
    queue: VecDeque<QueueEntry>,
    exec: Vec<(u8, u32)>,
    aggregator: SyncAggregator,
    reassembly: [LinkReassembler; 8],
    link_out: [VecDeque<LinkWord>; 8],
    pending_rounds: Vec<u8>,
    retired: u64,
}

impl KamletStub {
    fn new(topo: MeshTopology, x: u8, y: u8, params: &LamletParams) -> Self {
        Self {
            x,
            y,
            is_origin: x == 0 && y == 0,
            modulus: params.max_idents,
            depth: params.instruction_queue_length,
            completion_latency: params.completion_latency,
            queue: VecDeque::with_capacity(params.instruction_queue_length as usize),
            exec: Vec::new(),
            aggregator: SyncAggregator::new(topo, x, y, params.sync_table_capacity),
            reassembly: Default::default(),
            link_out: Default::default(),
            pending_rounds: Vec::new(),
            retired: 0,
        }
    }

    fn enqueue(&mut self, entry: QueueEntry) -> Result<(), EngineError> {
        if self.queue.len() as u32 == self.depth {
            return Err(EngineError::QueueOverflow { x: self.x, y: self.y });
        }
        self.queue.push_back(entry);
        Ok(())
    }

    /// Distance from `baseline` to the oldest ident still executing, full
    /// modulus when nothing is in flight. Only issued work counts: queue
    /// entries behind a query carry post-baseline idents, which must stay
    /// out of the minimum.
    fn oldest_distance(&self, baseline: u8) -> u8 {
        let sentinel = self.modulus as u8;
        self.exec
            .iter()
            .map(|&(ident, _)| {
                let d = ((ident as u16 + self.modulus - baseline as u16) % self.modulus) as u8;
                if d == 0 {
                    sentinel
                } else {
                    d
                }
            })
            .min()
            .unwrap_or(sentinel)
    }

    /// One execution cycle. The origin kamlet returns a completed round's
    /// result for delivery back to the lamlet.
    fn step(&mut self) -> Result<Option<(u8, u8)>, EngineError> {
        // Tick the execution set.
        let before = self.exec.len();
        self.exec.retain_mut(|(ident, remaining)| {
            *remaining -= 1;
            if *remaining == 0 {
                log::trace!("retired ident {}", ident);
                false
            } else {
                true
            }
        });
        self.retired += (before - self.exec.len()) as u64;

        // Issue one queue entry.
        match self.queue.pop_front() {
            Some(QueueEntry::Compute { ident, remaining }) => {
                self.exec.push((ident, remaining));
            }
            Some(QueueEntry::Query { round, baseline }) => {
                // Everything sent before the query has already issued, so
                // the execution set is exactly this kamlet's active idents.
                let distance = self.oldest_distance(baseline);
                log::debug!(
                    "kamlet ({},{}): query round {} baseline {} distance {}",
                    self.x,
                    self.y,
                    round,
                    baseline,
                    distance
                );
                self.aggregator.local_event(round, distance)?;
                self.pending_rounds.push(round);
            }
            None => {}
        }

        for (dir, msg) in self.aggregator.poll_sends() {
            for word in msg.to_link_words() {
                self.link_out[dir.index()].push_back(word);
            }
        }

        let mut response = None;
        let mut idx = 0;
        while idx < self.pending_rounds.len() {
            let round = self.pending_rounds[idx];
            if self.aggregator.is_complete(round) {
                let min = self.aggregator.take_completion(round).expect("checked complete");
                self.pending_rounds.remove(idx);
                if self.is_origin {
                    response = Some((round, min));
                }
            } else {
                idx += 1;
            }
        }
        Ok(response)
    }

    fn receive_link(&mut self, from: Direction, word: LinkWord) -> Result<(), EngineError> {
        if let Some(msg) = self.reassembly[from.index()].push(word)? {
            match self.aggregator.receive(from, msg) {
                // A full entry table sheds the message; the sender's round
                // stalls until a slot frees rather than killing the mesh.
                Err(SyncError::AggregationCapacityExceeded { .. }) => {
                    log::warn!(
                        "kamlet ({},{}): sync table full, dropping round {} from {:?}",
                        self.x,
                        self.y,
                        msg.round,
                        from
                    );
                }
                other => other?,
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.exec.is_empty()
            && self.link_out.iter().all(|q| q.is_empty())
    }
}

pub struct MeshEngine {
    topo: MeshTopology,
    input: VecDeque<Kinstr>,
    tracker: IdentTracker,
    framer: DispatchQueue,
    channel: VecDeque<u64>,
    channel_assembler: PacketAssembler,
    kamlets: Vec<KamletStub>,
    resp_channel: VecDeque<u64>,
    resp_assembler: PacketAssembler,
    cycle: u64,
    rounds: u64,
}

impl MeshEngine {
    pub fn new(params: &LamletParams) -> Self {
        let topo = MeshTopology::new(params.k_cols, params.k_rows);
        let kamlets = (0..topo.len())
            .map(|i| {
                let (x, y) = topo.coords(i);
                KamletStub::new(topo, x, y, params)
            })
            .collect();
        Self {
            topo,
            input: VecDeque::new(),
            tracker: IdentTracker::new(
                params.max_idents,
                topo.len(),
                params.instruction_queue_length,
            ),
            framer: DispatchQueue::new(
                topo,
                params.instruction_buffer_length,
                params.instructions_in_packet,
                params.flush_idle_cycles,
            ),
            channel: VecDeque::new(),
            channel_assembler: PacketAssembler::new(),
            kamlets,
            resp_channel: VecDeque::new(),
            resp_assembler: PacketAssembler::new(),
            cycle: 0,
            rounds: 0,
        }
    }

    /// Queue a kinstr for dispatch.
    pub fn push_kinstr(&mut self, kinstr: Kinstr) {
        self.input.push_back(kinstr);
    }

    /// Advance every component by one cycle.
    pub fn step(&mut self) -> Result<(), EngineError> {
        self.cycle += 1;

        // Lamlet dispatch and framing.
        self.tracker.step(&mut self.input, &mut self.framer)?;
        let ready = self.channel.len() < CHANNEL_DEPTH;
        if let Some(word) = self.framer.step(ready) {
            self.channel.push_back(word);
        }

        // Channel delivery, one word per cycle.
        if let Some(word) = self.channel.pop_front() {
            if let Some(packet) = self.channel_assembler.push_word(word) {
                self.deliver(packet)?;
            }
        }

        // Kamlet execution.
        for k in 0..self.kamlets.len() {
            if let Some((round, min)) = self.kamlets[k].step()? {
                self.send_response(round, min);
            }
        }

        // Sync link transfer, one word per link per cycle.
        let mut moves: Vec<(usize, Direction, LinkWord)> = Vec::new();
        for kamlet in &mut self.kamlets {
            for dir in ALL_DIRECTIONS {
                let Some((nx, ny)) = self.topo.neighbor(kamlet.x, kamlet.y, dir) else {
                    debug_assert!(kamlet.link_out[dir.index()].is_empty());
                    continue;
                };
                if let Some(word) = kamlet.link_out[dir.index()].pop_front() {
                    moves.push((self.topo.index(nx, ny), dir.opposite(), word));
                }
            }
        }
        for (dst, from, word) in moves {
            self.kamlets[dst].receive_link(from, word)?;
        }

        // Response path back to the lamlet, one word per cycle.
        if let Some(word) = self.resp_channel.pop_front() {
            if let Some(packet) = self.resp_assembler.push_word(word) {
                self.complete_round(packet)?;
            }
        }
        Ok(())
    }

    /// Run for up to `max_cycles`, stopping early at quiescence. Returns
    /// whether the mesh went idle.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> Result<bool, EngineError> {
        for _ in 0..max_cycles {
            if self.is_idle() {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(self.is_idle())
    }

    /// No work queued, in flight, or awaiting a response anywhere.
    pub fn is_idle(&self) -> bool {
        self.input.is_empty()
            && self.framer.is_empty()
            && self.channel.is_empty()
            && !self.channel_assembler.in_packet()
            && self.resp_channel.is_empty()
            && !self.resp_assembler.in_packet()
            && self.tracker.state() == RefreshState::Dormant
            && self.kamlets.iter().all(|k| k.is_idle())
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn available_idents(&self) -> u16 {
        self.tracker.available_idents()
    }

    pub fn tracker(&self) -> &IdentTracker {
        &self.tracker
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cycles: self.cycle,
            retired: self.kamlets.iter().map(|k| k.retired).sum(),
            rounds: self.rounds,
            dispatch: self.framer.stats(),
        }
    }

    fn deliver(&mut self, packet: Packet) -> Result<(), EngineError> {
        let targets: Vec<usize> = match packet.header.send_type {
            SendType::Broadcast => (0..self.kamlets.len()).collect(),
            SendType::Single => {
                vec![self.topo.index(packet.header.target_x, packet.header.target_y)]
            }
        };
        for word in &packet.words {
            let entry = match decode_word(*word) {
                DecodedWord::Compute { ident, .. } => QueueEntry::Compute {
                    ident,
                    remaining: self.kamlets[0].completion_latency.max(1),
                },
                DecodedWord::IdentQuery { baseline, round } => {
                    QueueEntry::Query { round, baseline }
                }
            };
            for &t in &targets {
                self.kamlets[t].enqueue(entry)?;
            }
        }
        Ok(())
    }

    fn send_response(&mut self, round: u8, min_distance: u8) {
        let packet = Packet {
            header: Header {
                target_x: 0,
                target_y: LAMLET_Y,
                source_x: 0,
                source_y: 0,
                count: 1,
                kind: MessageKind::IdentQueryResp,
                send_type: SendType::Single,
            },
            words: vec![round as u64 | (min_distance as u64) << 8],
        };
        self.resp_channel.push_back(packet.header.encode());
        self.resp_channel.extend(&packet.words);
    }

    fn complete_round(&mut self, packet: Packet) -> Result<(), EngineError> {
        if packet.header.kind != MessageKind::IdentQueryResp {
            return Err(EngineError::UnexpectedPacket { kind: packet.header.kind });
        }
        let word = packet.words.first().copied().unwrap_or(0);
        let round = word as u8;
        let min_distance = (word >> 8) as u8;
        self.tracker.complete_round(round, min_distance)?;
        self.rounds += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Dest;

    fn params_2x2() -> LamletParams {
        LamletParams {
            k_cols: 2,
            k_rows: 2,
            max_idents: 128,
            instruction_queue_length: 8,
            instructions_in_packet: 4,
            flush_idle_cycles: 3,
            instruction_buffer_length: 8,
            sync_table_capacity: 4,
            completion_latency: 6,
        }
    }

    #[test]
    fn test_broadcasts_charge_all_kamlets() {
        let mut engine = MeshEngine::new(&params_2x2());
        for i in 0..6 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Broadcast));
        }
        // One cycle stamps all six; the low-credit refresh only kicks in
        // on the following cycle.
        engine.step().unwrap();
        assert_eq!(engine.available_idents(), 121);
        for k in 0..4 {
            assert_eq!(engine.tracker().credits().available(k), 2);
        }
    }

    #[test]
    fn test_work_drains_to_idle() {
        let mut engine = MeshEngine::new(&params_2x2());
        for i in 0..6 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Broadcast));
        }
        assert!(engine.run_until_idle(10_000).unwrap());
        let stats = engine.stats();
        // Every kamlet retires every broadcast kinstr.
        assert_eq!(stats.retired, 24);
        assert_eq!(stats.dispatch.kinstrs, 6);
    }

    #[test]
    fn test_destination_isolation() {
        let mut engine = MeshEngine::new(&params_2x2());
        for i in 0..4 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Kamlet(2)));
        }
        assert!(engine.run_until_idle(10_000).unwrap());
        let stats = engine.stats();
        assert_eq!(stats.retired, 4);
        // Only kamlet 2's credits were charged.
        assert_eq!(engine.tracker().credits().available(2), 4);
        for k in [0usize, 1, 3] {
            assert_eq!(engine.tracker().credits().available(k), 8);
        }
    }

    #[test]
    fn test_reclamation_sustains_long_run() {
        // 200 broadcasts force the 128-ident space and the 8-deep credit
        // pools to wrap many times; progress proves rounds reclaim both.
        let mut engine = MeshEngine::new(&params_2x2());
        for i in 0..200 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Broadcast));
        }
        assert!(engine.run_until_idle(100_000).unwrap());
        let stats = engine.stats();
        assert_eq!(stats.retired, 800);
        assert_eq!(stats.dispatch.kinstrs, 200);
        assert!(stats.rounds > 0, "long run must trigger reclamation");
    }

    #[test]
    fn test_reclamation_on_single_kamlet() {
        let mut params = params_2x2();
        params.k_cols = 1;
        params.k_rows = 1;
        params.max_idents = 16;
        let mut engine = MeshEngine::new(&params);
        for i in 0..40 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Kamlet(0)));
        }
        assert!(engine.run_until_idle(100_000).unwrap());
        let stats = engine.stats();
        assert_eq!(stats.retired, 40);
        assert!(stats.rounds > 0);
    }

    #[test]
    fn test_mixed_traffic_classes() {
        let mut engine = MeshEngine::new(&params_2x2());
        for i in 0..3 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Kamlet(0)));
            engine.push_kinstr(Kinstr::ordered(100 + i, Dest::Kamlet(1)));
        }
        assert!(engine.run_until_idle(10_000).unwrap());
        assert_eq!(engine.stats().retired, 6);
    }

    #[test]
    fn test_three_by_three_mesh() {
        let mut params = params_2x2();
        params.k_cols = 3;
        params.k_rows = 3;
        let mut engine = MeshEngine::new(&params);
        for i in 0..100 {
            engine.push_kinstr(Kinstr::compute(i, Dest::Broadcast));
        }
        assert!(engine.run_until_idle(200_000).unwrap());
        let stats = engine.stats();
        assert_eq!(stats.retired, 900);
        assert!(stats.rounds > 0);
    }

    #[test]
    fn test_sync_table_overflow_sheds_message() {
        use crate::sync::SyncMessage;

        let mut params = params_2x2();
        params.sync_table_capacity = 1;
        let topo = MeshTopology::new(2, 2);
        let mut stub = KamletStub::new(topo, 0, 0, &params);
        stub.aggregator.local_event(0, 5).unwrap();
        assert_eq!(stub.aggregator.in_flight(), 1);

        // A message for a round the full table cannot seat is dropped, not
        // escalated to a fatal engine error.
        let words = SyncMessage { round: 1, value: 3 }.to_link_words();
        stub.receive_link(Direction::East, words[0]).unwrap();
        stub.receive_link(Direction::East, words[1]).unwrap();
        assert_eq!(stub.aggregator.in_flight(), 1);
    }

    #[test]
    fn test_idle_engine_stays_idle() {
        let mut engine = MeshEngine::new(&params_2x2());
        assert!(engine.is_idle());
        assert!(engine.run_until_idle(10).unwrap());
        assert_eq!(engine.cycle(), 0);
    }
}
