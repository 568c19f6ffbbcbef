//! # causerie-signal
//!
//! Call signaling over the replicated graph.  One mutable record per call
//! carries the offer/answer/reject/end steps; ICE candidates trickle as
//! append-only children next to it.  The engine task consumes commands and
//! replayed remote records, keeps one session per call id, and drives the
//! media seam; duplicate and out-of-order records are absorbed by the pure
//! session state machine.

pub mod engine;
pub mod media;
pub mod session;

mod error;

pub use engine::{spawn_engine, EndReason, EngineConfig, SignalCommand, SignalEvent};
pub use error::MediaError;
pub use media::{MediaFactory, MediaSession, RtcMediaFactory};
pub use session::{CallRole, CallSession, CallState, Step};
