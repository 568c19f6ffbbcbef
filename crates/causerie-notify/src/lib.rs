//! # causerie-notify
//!
//! The push-notification half of the node: deduplication of replayed
//! events, the device registry, burst coalescing, and delivery with
//! bounded retry against a Web Push provider.
//!
//! Delivery is deliberately decoupled from event ingestion: the router
//! enqueues [`Delivery`] items and the dispatch worker drives the fan-out,
//! so a slow provider can never stall the event stream.

pub mod debounce;
pub mod dedupe;
pub mod devices;
pub mod dispatch;
pub mod gateway;
pub mod worker;

mod error;

pub use debounce::DebounceCoalescer;
pub use dedupe::{EventClass, IdempotencyCache};
pub use devices::{Device, DeviceRegistry};
pub use dispatch::{DeliveryOutcome, Dispatcher, RetryPolicy};
pub use error::{NotifyError, PushError};
pub use gateway::{HttpPushGateway, PushGateway};
pub use worker::{spawn_dispatch_worker, Delivery};
