use causerie_store::StoreError;
use thiserror::Error;

/// Outcome of a single push POST to one endpoint.
#[derive(Debug, Error)]
pub enum PushError {
    /// The provider no longer knows this subscription.  Retrying is
    /// pointless; the device registration must be pruned.
    #[error("Subscription gone")]
    Gone,

    /// Anything that might succeed on a later attempt: connect failures,
    /// timeouts, 5xx responses, rate limiting.
    #[error("Transient push failure: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("All {attempts} delivery attempts failed: {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    #[error(transparent)]
    Registry(#[from] StoreError),
}
