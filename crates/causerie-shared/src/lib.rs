//! # causerie-shared
//!
//! Domain types shared by every Causerie crate: identities and record ids,
//! the serde schemas of every record stored in the replicated graph, push
//! notification payloads, and the VAPID key material used to authenticate
//! against push providers.

pub mod constants;
pub mod keys;
pub mod push;
pub mod records;
pub mod types;

mod error;

pub use error::KeyError;
pub use keys::VapidKeys;
pub use push::{NotificationKind, NotificationPayload};
pub use types::{now_millis, Alias, CallId, ChatId, DeviceId, GroupId};
