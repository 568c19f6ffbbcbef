//! # causerie-store
//!
//! Adapter surface for the replicated graph the application observes.
//!
//! The graph is eventually consistent and replication is at-least-once:
//! subscriptions replay already-known values, mutations may be observed
//! repeatedly, and ordering only holds per key.  Consumers must be
//! replay-safe; this crate makes no attempt to hide the hostile delivery
//! semantics, it only gives them a typed shape.  `MemoryStore` is the
//! in-process implementation the node and the tests run against; adapters
//! for networked backends implement the same trait.

pub mod memory;
pub mod path;
pub mod replicated;

mod error;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use path::KeyPath;
pub use replicated::{ChildEvent, ReplicatedStore};
