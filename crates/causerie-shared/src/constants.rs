/// Application name
pub const APP_NAME: &str = "Causerie";

/// Store-internal metadata key present in graph objects; never a recipient
pub const STORE_META_KEY: &str = "_";

/// Call record status while an offer stands unanswered
pub const CALL_STATUS_CONNECTING: &str = "connecting";

/// Maximum number of event ids the idempotency cache keeps
pub const DEDUPE_CAPACITY: usize = 5000;

/// How long a cached event id stays fresh (5 minutes)
pub const DEDUPE_TTL_SECS: u64 = 300;

/// Interval of the background sweep that drops expired cache entries
pub const DEDUPE_PURGE_INTERVAL_SECS: u64 = 60;

/// Default quiet window for coalescing chat notifications
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// How long a call may stay unestablished before it is force-ended
pub const CALL_ESTABLISH_TIMEOUT_SECS: u64 = 30;

/// How long an ended call id is remembered to swallow stale replays
pub const ENDED_CALL_MEMORY_SECS: u64 = 300;

/// Total delivery attempts per notification (first try included)
pub const PUSH_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt; doubles per further attempt
pub const PUSH_BACKOFF_START_SECS: u64 = 1;

/// `TTL` header sent to the push provider (one day)
pub const PUSH_TTL_SECS: u64 = 86_400;

/// Validity window of a minted VAPID authorization token (12 hours)
pub const VAPID_TOKEN_VALIDITY_SECS: u64 = 12 * 60 * 60;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 3005;

/// Default VAPID key material file
pub const DEFAULT_VAPID_KEY_FILE: &str = "vapid-keys.json";

/// Default VAPID subject claim
pub const DEFAULT_VAPID_SUBJECT: &str = "mailto:ops@causerie.example";

/// Capacity of the command/delivery channels between tasks
pub const CHANNEL_CAPACITY: usize = 256;

/// Concurrent deliveries the dispatch worker runs at most
pub const DISPATCH_MAX_IN_FLIGHT: usize = 8;

/// STUN servers used by call media sessions
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.relay.metered.ca:80",
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
