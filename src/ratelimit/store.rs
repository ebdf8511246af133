//! Concurrent client-to-bucket registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::bucket::{BucketSettings, TokenBucket};
use crate::client::ClientId;
use crate::clock::Timestamp;

/// A bucket shared between the registry and in-flight checks.
pub type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Client-to-bucket storage behind a rate limiter.
///
/// Implementations must create at most one bucket per client, even when
/// several first requests for that client race, and must hand out the same
/// shared bucket to every caller until it is evicted.
pub trait BucketRegistry: Send + Sync {
    /// Get the bucket for `client`, creating a full one from `settings` if
    /// none exists.
    fn get_or_create(&self, client: &ClientId, settings: BucketSettings, now: Timestamp) -> SharedBucket;

    fn get(&self, client: &ClientId) -> Option<SharedBucket> {
        self.buckets.get(client).map(|bucket| Arc::clone(bucket.value()))
    }

    /// A bucket is removed only if it has refilled to capacity by `now` and
    /// no in-flight check holds a reference to it.
    fn evict_idle(&self, now: Timestamp) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            let mut bucket = bucket.lock();
            bucket.refill(now);
            !bucket.is_full()
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.buckets.len(), "Evicted idle buckets");
        }
        evicted
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::ConsumeOutcome;

    fn settings(capacity: f64, rate: f64) -> BucketSettings {
        BucketSettings::new(capacity, rate).unwrap()
    }

    #[test]
    fn test_get_or_create_reuses_bucket() {
        let store = BucketStore::new();
        let client = ClientId::new("client-a");
        let now = Timestamp::from_unix_millis(0);

        let first = store.get_or_create(&client, settings(10.0, 1.0), now);
        first.lock().try_consume(4.0, now).unwrap();

        let second = store.get_or_create(&client, settings(10.0, 1.0), now);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().available(), 6.0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.created_count(), 1);
    }

    #[test]
    fn test_get_does_not_create() {
        let store = BucketStore::new();
        assert!(store.get(&ClientId::new("nobody")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_first_use_creates_one_bucket() {
        let store = BucketStore::new();
        let client = ClientId::new("brand-new");
        let now = Timestamp::from_unix_millis(0);

        std::thread::scope(|scope| {
            for _ in 0..100 {
                scope.spawn(|| {
                    let bucket = store.get_or_create(&client, settings(1000.0, 1.0), now);
                    let outcome = bucket.lock().try_consume(1.0, now).unwrap();
                    assert!(matches!(outcome, ConsumeOutcome::Success { .. }));
                });
            }
        });

        assert_eq!(store.len(), 1);
        assert_eq!(store.created_count(), 1);
        let bucket = store.get(&client).unwrap();
        assert_eq!(bucket.lock().available(), 900.0);
    }

    #[test]
    fn test_evict_idle_only_removes_full_buckets() {
        let store = BucketStore::new();
        let now = Timestamp::from_unix_millis(0);
        let busy = ClientId::new("busy");
        let idle = ClientId::new("idle");

        store
            .get_or_create(&busy, settings(2.0, 1.0), now)
            .lock()
            .try_consume(2.0, now)
            .unwrap();
        store.get_or_create(&idle, settings(2.0, 1.0), now);

        assert_eq!(store.evict_idle(now), 1);
        assert!(store.get(&idle).is_none());
        assert!(store.get(&busy).is_some());

        // Two seconds later the busy bucket is full again.
        assert_eq!(store.evict_idle(Timestamp::from_unix_millis(2_000)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_evict_idle_skips_buckets_in_use() {
        let store = BucketStore::new();
        let now = Timestamp::from_unix_millis(0);
        let client = ClientId::new("in-flight");

        let held = store.get_or_create(&client, settings(2.0, 1.0), now);
        assert_eq!(store.evict_idle(now), 0);
        assert_eq!(store.len(), 1);

        drop(held);
        assert_eq!(store.evict_idle(now), 1);
    }
}
