//! Distributed minimum aggregation over the kamlet mesh.
//!
//! Reclamation rounds need the minimum of every node's reported distance.
//! Rather than funnel all reports to one point, each node runs the same
//! quadrant-wavefront exchange: it tells each neighbor the minimum over
//! everything on the far side of itself, and combines the eight regional
//! minima it hears with its own value. Every node converges on the global
//! minimum in one sweep, with exactly one message per link direction.

pub mod aggregator;
pub mod wire;

pub use aggregator::{SyncAggregator, SyncError};
pub use wire::{LinkReassembler, LinkWord, SyncMessage, WireError};
