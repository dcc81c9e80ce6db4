//! Tick-driven emulation of the lamlet and its kamlet mesh.
//!
//! The engine wires the dispatch pipeline to simplified kamlets: each
//! kamlet drains its instruction queue at a fixed per-kinstr latency, runs
//! a sync aggregation node, and the origin kamlet reports reclamation
//! results back to the lamlet. One [`MeshEngine::step`] call advances every
//! component by one cycle in a fixed phase order.
//!
//! # Example
//!
//! ```ignore
//! use lamlet_emu::emu::MeshEngine;
//! use lamlet_emu::packet::{Dest, Kinstr};
//! use lamlet_emu::params::LamletParams;
//!
//! let mut engine = MeshEngine::new(&LamletParams::default());
//! engine.push_kinstr(Kinstr::compute(0x1234, Dest::Broadcast));
//! engine.run_until_idle(10_000)?;
//! ```

pub mod engine;

pub use engine::{EngineError, EngineStats, MeshEngine};
