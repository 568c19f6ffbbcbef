use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use causerie_shared::constants::{DEDUPE_CAPACITY, DEDUPE_TTL_SECS};

/// Which id namespace an event belongs to.  Ids are only unique within
/// their class, so classes never share cache keys: a call id can never
/// suppress a chat message or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Call,
    DirectMessage,
    GroupMessage,
    Inbox,
}

/// Bounded LRU + TTL memory of recently processed event ids.
///
/// The replicated store replays events freely, so the router consults
/// this cache before acting.  It is a throughput optimization, not the
/// correctness mechanism: entries expire and the cache is bounded, so
/// handlers behind it stay idempotent in their own right.
pub struct IdempotencyCache {
    entries: LruCache<(EventClass, String), Instant>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEDUPE_CAPACITY, Duration::from_secs(DEDUPE_TTL_SECS))
    }

    /// Whether this event id was marked within the TTL.  An expired entry
    /// is dropped on the way out.
    pub fn seen(&mut self, class: EventClass, id: &str) -> bool {
        let key = (class, id.to_string());
        let fresh = match self.entries.get(&key) {
            Some(marked_at) => marked_at.elapsed() < self.ttl,
            None => return false,
        };
        if !fresh {
            self.entries.pop(&key);
        }
        fresh
    }

    pub fn mark_seen(&mut self, class: EventClass, id: impl Into<String>) {
        self.entries.put((class, id.into()), Instant::now());
    }

    /// Drop every expired entry, returning how many went.  Run from a
    /// periodic sweep so dead ids do not squat in the LRU.
    pub fn purge_stale(&mut self) -> usize {
        let expired: Vec<(EventClass, String)> = self
            .entries
            .iter()
            .filter(|(_, marked_at)| marked_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_then_seen() {
        let mut cache = IdempotencyCache::new(16, Duration::from_secs(60));
        assert!(!cache.seen(EventClass::DirectMessage, "m1"));
        cache.mark_seen(EventClass::DirectMessage, "m1");
        assert!(cache.seen(EventClass::DirectMessage, "m1"));
    }

    #[test]
    fn test_classes_are_independent() {
        let mut cache = IdempotencyCache::new(16, Duration::from_secs(60));
        cache.mark_seen(EventClass::Call, "1713");
        assert!(cache.seen(EventClass::Call, "1713"));
        assert!(!cache.seen(EventClass::DirectMessage, "1713"));
        assert!(!cache.seen(EventClass::GroupMessage, "1713"));
    }

    #[test]
    fn test_expired_entry_is_forgotten() {
        let mut cache = IdempotencyCache::new(16, Duration::ZERO);
        cache.mark_seen(EventClass::Inbox, "r1");
        assert!(!cache.seen(EventClass::Inbox, "r1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = IdempotencyCache::new(2, Duration::from_secs(60));
        cache.mark_seen(EventClass::DirectMessage, "m1");
        cache.mark_seen(EventClass::DirectMessage, "m2");
        cache.mark_seen(EventClass::DirectMessage, "m3");
        assert_eq!(cache.len(), 2);
        assert!(!cache.seen(EventClass::DirectMessage, "m1"));
        assert!(cache.seen(EventClass::DirectMessage, "m3"));
    }

    #[test]
    fn test_purge_stale_sweeps_expired() {
        let mut cache = IdempotencyCache::new(16, Duration::ZERO);
        cache.mark_seen(EventClass::Call, "1");
        cache.mark_seen(EventClass::Call, "2");
        assert_eq!(cache.purge_stale(), 2);
        assert!(cache.is_empty());
    }
}
