//! Lamlet-side dispatch: sequencing, flow control, and packet framing.
//!
//! Kinstrs enter unsequenced, get stamped with a wrapping sequence ident and
//! charged against per-kamlet queue credits by the [`IdentTracker`], then
//! flow into the [`DispatchQueue`] which batches same-destination kinstrs
//! into packets and trickles them onto the outbound channel one word per
//! cycle. Idents and credits are both reclaimed by periodic query rounds
//! aggregated over the sync mesh.

pub mod credit;
pub mod framer;
pub mod ident;
pub mod tracker;

pub use credit::CreditTracker;
pub use framer::{DispatchQueue, DispatchStats};
pub use ident::IdentAllocator;
pub use tracker::{IdentTracker, RefreshState};

use thiserror::Error;

use crate::packet::Dest;

/// Errors from the dispatch pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("ident space exhausted: {outstanding} outstanding of modulus {modulus}")]
    IdentExhausted { outstanding: u16, modulus: u16 },
    #[error("no queue credit for {dest:?}")]
    CreditUnderflow { dest: Dest },
    #[error("reclamation round already in flight")]
    RoundInFlight,
    #[error("query response for round {got}, expected {expected:?}")]
    UnexpectedResponse { got: u8, expected: Option<u8> },
    #[error("query response distance {distance} exceeds modulus {modulus}")]
    DistanceOutOfRange { distance: u16, modulus: u16 },
}
