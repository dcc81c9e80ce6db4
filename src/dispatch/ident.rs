//! Wrapping sequence ident allocation.
//!
//! Idents live in a circular space of size `modulus`. `next` is the next
//! ident to hand out and `oldest` is a lower bound on the oldest ident that
//! may still be active anywhere in the lamlet; only reclamation rounds move
//! `oldest` forward. One ident is always left unallocated so a full ring and
//! an empty ring cannot alias.

use crate::dispatch::DispatchError;

#[derive(Debug)]
pub struct IdentAllocator {
    modulus: u16,
    next: u8,
    oldest: u8,
    total_allocated: u64,
}

impl IdentAllocator {
    pub fn new(modulus: u16) -> Self {
        debug_assert!((4..=255).contains(&modulus));
        Self { modulus, next: 0, oldest: 0, total_allocated: 0 }
    }

    /// Idents handed out and not yet known reclaimed.
    pub fn outstanding(&self) -> u16 {
        let m = self.modulus as i32;
        ((self.next as i32 - self.oldest as i32).rem_euclid(m)) as u16
    }

    /// Idents that can still be allocated before the ring would alias.
    pub fn available(&self) -> u16 {
        self.modulus - 1 - self.outstanding()
    }

    /// Hand out the next ident. The caller is expected to have checked
    /// [`available`](Self::available); running dry here is a flow-control
    /// bug upstream.
    pub fn allocate(&mut self) -> Result<u8, DispatchError> {
        if self.available() == 0 {
            return Err(DispatchError::IdentExhausted {
                outstanding: self.outstanding(),
                modulus: self.modulus,
            });
        }
        let ident = self.next;
        self.next = ((self.next as u16 + 1) % self.modulus) as u8;
        self.total_allocated += 1;
        Ok(ident)
    }

    /// Advance the oldest-active lower bound from a completed reclamation
    /// round.
    pub fn update_oldest(&mut self, oldest: u8) {
        log::debug!(
            "ident reclaim: oldest {} -> {} (next {})",
            self.oldest,
            oldest,
            self.next
        );
        self.oldest = oldest;
    }

    pub fn has_outstanding_work(&self) -> bool {
        self.outstanding() > 0
    }

    pub fn modulus(&self) -> u16 {
        self.modulus
    }

    pub fn next_ident(&self) -> u8 {
        self.next
    }

    pub fn oldest(&self) -> u8 {
        self.oldest
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }
}
