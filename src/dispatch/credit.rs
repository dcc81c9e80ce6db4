//! Per-kamlet instruction queue credits.
//!
//! Every kamlet owns a bounded instruction queue; the lamlet holds one
//! credit per slot and spends a credit per kinstr sent there (a broadcast
//! spends one at every kamlet). Credits only come back through reclamation
//! rounds: a query response proves the kamlet dequeued everything sent
//! before the query, so every credit spent since the previous round is
//! returned in one batch.
//!
//! Normal traffic may never spend a kamlet's last credit. That credit is
//! reserved for the reclamation query itself, so a round can always be
//! started and the credit pool cannot wedge at zero.

use crate::dispatch::DispatchError;
use crate::packet::Dest;

#[derive(Debug)]
pub struct CreditTracker {
    depth: u32,
    available: Vec<u32>,
    used_since_round: Vec<u32>,
    in_flight_for_round: Vec<u32>,
    round_active: bool,
}

impl CreditTracker {
    pub fn new(kamlets: usize, depth: u32) -> Self {
        Self {
            depth,
            available: vec![depth; kamlets],
            used_since_round: vec![0; kamlets],
            in_flight_for_round: vec![0; kamlets],
            round_active: false,
        }
    }

    /// Whether `dest` can be charged. Normal traffic keeps at least one
    /// credit in reserve; a reclamation query may take the last one.
    pub fn has_credit(&self, dest: Dest, reclaim: bool) -> bool {
        let floor = if reclaim { 0 } else { 1 };
        match dest {
            Dest::Kamlet(k) => self.available[k as usize] > floor,
            Dest::Broadcast => self.available.iter().all(|&a| a > floor),
        }
    }

    /// Charge one credit per targeted kamlet.
    pub fn consume(&mut self, dest: Dest) -> Result<(), DispatchError> {
        match dest {
            Dest::Kamlet(k) => {
                let k = k as usize;
                if self.available[k] == 0 {
                    return Err(DispatchError::CreditUnderflow { dest });
                }
                self.available[k] -= 1;
                self.used_since_round[k] += 1;
            }
            Dest::Broadcast => {
                if self.available.iter().any(|&a| a == 0) {
                    return Err(DispatchError::CreditUnderflow { dest });
                }
                for k in 0..self.available.len() {
                    self.available[k] -= 1;
                    self.used_since_round[k] += 1;
                }
            }
        }
        Ok(())
    }

    /// Any kamlet below half depth wants a reclamation round.
    pub fn low_watermark(&self) -> bool {
        self.available.iter().any(|&a| a < self.depth / 2)
    }

    /// Snapshot the credits spent since the last round; they come back when
    /// this round's response arrives. The query broadcast itself must
    /// already be charged so its credits ride in the snapshot.
    pub fn begin_round(&mut self) -> Result<(), DispatchError> {
        if self.round_active {
            return Err(DispatchError::RoundInFlight);
        }
        for k in 0..self.available.len() {
            self.in_flight_for_round[k] = self.used_since_round[k];
            self.used_since_round[k] = 0;
        }
        self.round_active = true;
        log::debug!("credit round begin: in flight {:?}", self.in_flight_for_round);
        Ok(())
    }

    /// Return every credit snapshotted by the in-flight round.
    pub fn end_round(&mut self) {
        debug_assert!(self.round_active);
        for k in 0..self.available.len() {
            self.available[k] += self.in_flight_for_round[k];
            self.in_flight_for_round[k] = 0;
            debug_assert!(self.available[k] <= self.depth);
        }
        self.round_active = false;
        log::debug!("credit round end: available {:?}", self.available);
    }

    pub fn round_active(&self) -> bool {
        self.round_active
    }

    pub fn available(&self, kamlet: usize) -> u32 {
        self.available[kamlet]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_last_credit() {
        let mut credits = CreditTracker::new(2, 2);
        assert!(credits.has_credit(Dest::Kamlet(0), false));
        credits.consume(Dest::Kamlet(0)).unwrap();
        // One credit left: normal traffic blocked, reclaim allowed.
        assert!(!credits.has_credit(Dest::Kamlet(0), false));
        assert!(credits.has_credit(Dest::Kamlet(0), true));
        assert!(credits.has_credit(Dest::Kamlet(1), false));
    }

    #[test]
    fn test_broadcast_charges_every_kamlet() {
        let mut credits = CreditTracker::new(3, 4);
        credits.consume(Dest::Broadcast).unwrap();
        for k in 0..3 {
            assert_eq!(credits.available(k), 3);
        }
    }

    #[test]
    fn test_broadcast_needs_credit_everywhere() {
        let mut credits = CreditTracker::new(2, 2);
        credits.consume(Dest::Kamlet(1)).unwrap();
        // Kamlet 1 is down to its reserved credit.
        assert!(!credits.has_credit(Dest::Broadcast, false));
        assert!(credits.has_credit(Dest::Broadcast, true));
    }

    #[test]
    fn test_round_returns_spent_credits() {
        let mut credits = CreditTracker::new(2, 8);
        for _ in 0..3 {
            credits.consume(Dest::Kamlet(0)).unwrap();
        }
        credits.consume(Dest::Broadcast).unwrap();
        credits.begin_round().unwrap();
        assert_eq!(credits.available(0), 4);
        assert_eq!(credits.available(1), 7);

        // Traffic after the round began is not part of its snapshot.
        credits.consume(Dest::Kamlet(1)).unwrap();
        credits.end_round();
        assert_eq!(credits.available(0), 8);
        assert_eq!(credits.available(1), 7);
        assert!(!credits.round_active());
    }

    #[test]
    fn test_single_round_at_a_time() {
        let mut credits = CreditTracker::new(1, 4);
        credits.begin_round().unwrap();
        assert_eq!(credits.begin_round(), Err(DispatchError::RoundInFlight));
    }

    #[test]
    fn test_low_watermark() {
        let mut credits = CreditTracker::new(2, 8);
        assert!(!credits.low_watermark());
        for _ in 0..5 {
            credits.consume(Dest::Kamlet(1)).unwrap();
        }
        assert!(credits.low_watermark());
    }

    #[test]
    fn test_underflow_detected() {
        let mut credits = CreditTracker::new(1, 1);
        credits.consume(Dest::Kamlet(0)).unwrap();
        assert_eq!(
            credits.consume(Dest::Kamlet(0)),
            Err(DispatchError::CreditUnderflow { dest: Dest::Kamlet(0) })
        );
    }
}
