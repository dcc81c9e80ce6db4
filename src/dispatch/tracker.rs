//! Ident tracking and reclamation round control.
//!
//! The tracker sits between the raw kinstr input and the framer. Each cycle
//! it stamps as many input kinstrs as idents, credits, and framer room
//! allow, charging each destination's queue credit on the way. When idents or
//! credits run low it raises a reclamation round: a query broadcast carrying
//! a baseline ident, answered eventually with the minimum distance from that
//! baseline to the oldest still-active ident anywhere in the mesh.
//!
//! The refresh state machine has three states. `Dormant` is steady-state
//! dispatch. `ReadyToSend` means a round has been triggered but the query
//! has not yet entered the framer; normal dispatch is held off so the query
//! cannot be pushed back indefinitely by younger traffic. `WaitingForResponse`
//! covers the round's flight time, during which normal dispatch resumes on
//! whatever credits remain.

use std::collections::VecDeque;

use crate::dispatch::credit::CreditTracker;
use crate::dispatch::framer::DispatchQueue;
use crate::dispatch::ident::IdentAllocator;
use crate::dispatch::DispatchError;
use crate::packet::{Dest, Kinstr, KinstrOp, SequencedKinstr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Dormant,
    ReadyToSend,
    WaitingForResponse,
}

/// Captured context for the in-flight round.
#[derive(Debug, Clone, Copy)]
struct QuerySlot {
    round: u8,
    baseline: u8,
    /// Distance to the oldest kinstr still held in the framer when the
    /// query was created, if any. Folded into the response so traffic the
    /// mesh has not seen yet cannot be reclaimed.
    local_dist: Option<u8>,
}

#[derive(Debug)]
pub struct IdentTracker {
    allocator: IdentAllocator,
    credits: CreditTracker,
    state: RefreshState,
    next_round: u8,
    slot: Option<QuerySlot>,
}

impl IdentTracker {
    pub fn new(modulus: u16, kamlets: usize, queue_depth: u32) -> Self {
        Self {
            allocator: IdentAllocator::new(modulus),
            credits: CreditTracker::new(kamlets, queue_depth),
            state: RefreshState::Dormant,
            next_round: 0,
            slot: None,
        }
    }

    /// One dispatch cycle: maybe start a round, maybe emit the query, and
    /// accept as many kinstrs from `input` as flow control allows.
    pub fn step(
        &mut self,
        input: &mut VecDeque<Kinstr>,
        framer: &mut DispatchQueue,
    ) -> Result<(), DispatchError> {
        if self.state == RefreshState::Dormant && self.should_refresh() {
            log::debug!(
                "refresh triggered: {} idents available, low credits {}",
                self.allocator.available(),
                self.credits.low_watermark()
            );
            self.state = RefreshState::ReadyToSend;
        }

        if self.state == RefreshState::ReadyToSend {
            if framer.has_room() && self.credits.has_credit(Dest::Broadcast, true) {
                self.emit_query(framer)?;
            }
            // Normal dispatch stays held until the query is in the framer.
            return Ok(());
        }

        while let Some(front) = input.front() {
            if self.allocator.available() == 0
                || !self.credits.has_credit(front.dest, false)
                || !framer.has_room()
            {
                break;
            }
            let kinstr = input.pop_front().expect("front checked above");
            let ident = self.allocator.allocate()?;
            self.credits.consume(kinstr.dest)?;
            let stamped = SequencedKinstr {
                ident,
                op: kinstr.op,
                dest: kinstr.dest,
                ordered: kinstr.ordered,
            };
            let pushed = framer.push(stamped);
            debug_assert!(pushed, "framer room checked above");
        }
        Ok(())
    }

    /// Handle the aggregated response for a round and advance the oldest
    /// ident bound. `min_distance` of the full modulus is the all-clear
    /// sentinel: nothing older than the baseline is active anywhere.
    pub fn complete_round(&mut self, round: u8, min_distance: u8) -> Result<(), DispatchError> {
        let slot = match self.slot {
            Some(slot) if slot.round == round => slot,
            other => {
                return Err(DispatchError::UnexpectedResponse {
                    got: round,
                    expected: other.map(|s| s.round),
                })
            }
        };
        let modulus = self.allocator.modulus();
        if min_distance as u16 > modulus {
            return Err(DispatchError::DistanceOutOfRange {
                distance: min_distance as u16,
                modulus,
            });
        }
        let sentinel = modulus as u8;
        let folded = min_distance.min(slot.local_dist.unwrap_or(sentinel));
        let oldest = if folded == sentinel {
            slot.baseline
        } else {
            ((slot.baseline as u16 + folded as u16) % modulus) as u8
        };
        log::debug!(
            "round {} complete: min distance {} (local {:?}), oldest -> {}",
            round,
            min_distance,
            slot.local_dist,
            oldest
        );
        self.allocator.update_oldest(oldest);
        self.credits.end_round();
        self.slot = None;
        self.state = RefreshState::Dormant;
        Ok(())
    }

    /// True while any ident may still be active or a round is in flight.
    pub fn busy(&self) -> bool {
        self.allocator.has_outstanding_work() || self.slot.is_some()
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn available_idents(&self) -> u16 {
        self.allocator.available()
    }

    pub fn allocator(&self) -> &IdentAllocator {
        &self.allocator
    }

    pub fn credits(&self) -> &CreditTracker {
        &self.credits
    }

    fn should_refresh(&self) -> bool {
        self.allocator.available() < self.allocator.modulus() / 2 || self.credits.low_watermark()
    }

    fn emit_query(&mut self, framer: &mut DispatchQueue) -> Result<(), DispatchError> {
        let modulus = self.allocator.modulus();
        // The baseline is the most recently allocated ident. Every active
        // ident then sits at or behind it, and distances measured forward
        // from it order strictly by age.
        let baseline = ((self.allocator.next_ident() as u16 + modulus - 1) % modulus) as u8;
        // Kinstrs still held in the framer are invisible to the kamlets'
        // reports; the lamlet contributes their distance itself so the
        // round cannot reclaim past them.
        let local_dist = framer
            .pending_idents()
            .map(|i| {
                let d = ((i as u16 + modulus - baseline as u16) % modulus) as u8;
                if d == 0 {
                    modulus as u8
                } else {
                    d
                }
            })
            .min();

        let round = self.next_round;
        self.next_round = self.next_round.wrapping_add(1);

        self.credits.consume(Dest::Broadcast)?;
        self.credits.begin_round()?;
        let pushed = framer.push(SequencedKinstr {
            ident: round,
            op: KinstrOp::IdentQuery { baseline },
            dest: Dest::Broadcast,
            ordered: false,
        });
        debug_assert!(pushed, "framer room checked by caller");
        self.slot = Some(QuerySlot { round, baseline, local_dist });
        self.state = RefreshState::WaitingForResponse;
        log::debug!(
            "query round {} emitted: baseline {} local distance {:?}",
            round,
            baseline,
            local_dist
        );
        Ok(())
    }
}
