//! Bounded cache of recently observed message keys.
//!
//! Entries leave the set when it is full (oldest first) or when they are
//! older than the configured TTL. While an entry is resident, a duplicate is
//! always detected; after it leaves, the same key may be accepted again.

use pychain_protocol::MessageKey;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default number of keys kept.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Default lifetime of an entry.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct SeenInner {
    /// Key -> insertion time
    entries: HashMap<MessageKey, Instant>,
    /// Insertion order, oldest at the front
    order: VecDeque<(MessageKey, Instant)>,
}

impl SeenInner {
    fn expire(&mut self, now: Instant, ttl: Duration) {
        while let Some((key, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < ttl {
                break;
            }
            self.entries.remove(key);
            self.order.pop_front();
        }
    }
}

/// Deduplication set keyed by `(originator, id)`.
#[derive(Debug)]
pub struct SeenSet {
    inner: Mutex<SeenInner>,
    capacity: usize,
    ttl: Duration,
}

impl SeenSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record `key`; returns `true` if it was not already resident.
    ///
    /// Test and insert happen under one lock, so concurrent receivers of the
    /// same key get exactly one `true`.
    pub async fn insert(&self, key: MessageKey) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.expire(now, self.ttl);

        if inner.entries.contains_key(&key) {
            return false;
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((oldest, _)) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.entries.insert(key.clone(), now);
        inner.order.push_back((key, now));
        true
    }

    pub async fn contains(&self, key: &MessageKey) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.expire(now, self.ttl);
        inner.entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.expire(now, self.ttl);
        inner.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pychain_protocol::Guid;
    use std::sync::Arc;

    fn key(originator: &Guid, id: u64) -> MessageKey {
        MessageKey {
            originator: originator.clone(),
            id,
        }
    }

    #[tokio::test]
    async fn test_duplicate_is_detected() {
        let seen = SeenSet::default();
        let origin = Guid::generate();

        assert!(seen.insert(key(&origin, 7)).await);
        assert!(!seen.insert(key(&origin, 7)).await);
        assert!(seen.insert(key(&origin, 8)).await);
        assert!(seen.insert(key(&Guid::generate(), 7)).await);
        assert_eq!(seen.len().await, 3);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let seen = SeenSet::new(2, DEFAULT_SEEN_TTL);
        let origin = Guid::generate();

        seen.insert(key(&origin, 1)).await;
        seen.insert(key(&origin, 2)).await;
        seen.insert(key(&origin, 3)).await;

        assert_eq!(seen.len().await, 2);
        assert!(!seen.contains(&key(&origin, 1)).await);
        assert!(seen.contains(&key(&origin, 2)).await);
        assert!(seen.contains(&key(&origin, 3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let seen = SeenSet::new(16, Duration::from_secs(10));
        let origin = Guid::generate();

        seen.insert(key(&origin, 1)).await;
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(seen.contains(&key(&origin, 1)).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!seen.contains(&key(&origin, 1)).await);
        assert!(seen.insert(key(&origin, 1)).await);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_one() {
        let seen = Arc::new(SeenSet::default());
        let origin = Guid::generate();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let seen = seen.clone();
            let key = key(&origin, 42);
            handles.push(tokio::spawn(async move { seen.insert(key).await }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
