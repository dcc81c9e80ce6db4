//! lamlet-emu library
//!
//! Functional model of the lamlet dispatch core: the front end that stamps
//! vector micro-instructions (kinstrs) with wrapping sequence identifiers,
//! tracks per-kamlet instruction-queue credits, batches instructions into
//! network packets, and runs the mesh-wide identifier reclamation protocol
//! over the dedicated synchronization network.

pub mod dispatch;
pub mod emu;
pub mod mesh;
pub mod packet;
pub mod params;
pub mod sync;
