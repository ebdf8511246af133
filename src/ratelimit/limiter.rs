//! Single-tier rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::bucket::{validate_cost, BucketSettings, ConsumeOutcome};
use super::store::{BucketRegistry, BucketStore, SharedBucket};
use crate::client::ClientId;
use crate::clock::{Clock, Timestamp};
use crate::error::{Result, TollgateError};
use crate::token::{RateLimitToken, TokenIssuer};

/// A named tier: one bucket configuration applied to every client.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSettings {
    name: String,
    bucket: BucketSettings,
}

impl TierSettings {
    /// Validate and create tier settings.
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate_per_second: f64) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TollgateError::InvalidConfiguration(
                "tier name must not be empty".to_string(),
            ));
        }
        let bucket = BucketSettings::new(capacity, refill_rate_per_second).map_err(|e| match e {
            TollgateError::InvalidConfiguration(msg) => {
                TollgateError::InvalidConfiguration(format!("tier '{}': {}", name, msg))
            }
            other => other,
        })?;
        Ok(Self { name, bucket })
    }

    /// A tier allowing `requests` per `window`, with bursts up to `requests`.
    pub fn per_window(name: impl Into<String>, requests: u64, window: Duration) -> Result<Self> {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(
                "tier window must be positive".to_string(),
            ));
        }
        let capacity = requests as f64;
        Self::new(name, capacity, capacity / secs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket(&self) -> BucketSettings {
        self.bucket
    }
}

/// Outcome of a rate limit check.
#[derive(Debug)]
pub enum RateLimitResult {
    /// The cost was consumed; the token proves it.
    Allowed { token: RateLimitToken },
    /// Nothing was consumed.
    Denied {
        /// Balance of the bucket that refused the request.
        remaining_tokens: f64,
        /// Earliest time a retry could succeed, absent other consumers.
        retry_after: Timestamp,
        reason: String,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Take the proof token out of an `Allowed` result.
    pub fn into_token(self) -> Option<RateLimitToken> {
        match self {
            RateLimitResult::Allowed { token } => Some(token),
            RateLimitResult::Denied { .. } => None,
        }
    }

    /// The retry hint of a `Denied` result.
    pub fn retry_after(&self) -> Option<Timestamp> {
        match self {
            RateLimitResult::Allowed { .. } => None,
            RateLimitResult::Denied { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// Admits or denies requests against one tier of per-client buckets.
///
/// Buckets are kept in a [`BucketRegistry`], an in-process [`BucketStore`]
/// unless another registry is supplied with [`RateLimiter::with_registry`].
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter<R = BucketStore> {
    tier: TierSettings,
    store: R,
    clock: Arc<dyn Clock>,
    issuer: TokenIssuer,
}

impl RateLimiter {
    /// Create a rate limiter for one tier backed by a fresh `BucketStore`.
    pub fn new(tier: TierSettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_registry(tier, BucketStore::new(), clock)
    }
}

impl<R> RateLimiter<R>
where
    R: BucketRegistry,
{
    /// Create a rate limiter for one tier that keeps its buckets in `store`.
    pub fn with_registry(tier: TierSettings, store: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            tier,
            store,
            clock,
            issuer: TokenIssuer::default(),
        }
    }

    /// Set how long issued tokens stay valid.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.issuer = TokenIssuer::new(ttl);
        self
    }

    /// Try to spend `cost` tokens from `client`'s bucket.
    pub fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult> {
        validate_cost(cost)?;
        let now = self.clock.now();
        let bucket = self.bucket(client, now);

        trace!(
            tier = %self.tier.name,
            client = %client,
            cost = cost,
            "Checking rate limit"
        );

        let mut bucket = bucket.lock();
        match bucket.try_consume(cost, now)? {
            ConsumeOutcome::Success { remaining } => {
                drop(bucket);
                Ok(RateLimitResult::Allowed {
                    token: self.issuer.rate_limit_token(client, now, remaining),
                })
            }
            ConsumeOutcome::Failure { .. } => {
                let available = bucket.available();
                let retry_after = bucket.retry_after(cost, now);
                drop(bucket);

                debug!(
                    tier = %self.tier.name,
                    client = %client,
                    available = available,
                    cost = cost,
                    retry_after = %retry_after,
                    "Rate limit exceeded"
                );
                Ok(RateLimitResult::Denied {
                    remaining_tokens: available,
                    retry_after,
                    reason: self.denial_reason(available, cost),
                })
            }
        }
    }

    /// Try to spend a single token.
    pub fn try_acquire_one(&self, client: &ClientId) -> Result<RateLimitResult> {
        self.try_acquire(client, 1.0)
    }

    /// Current balance for `client`, or `None` if it has no bucket yet.
    pub fn available(&self, client: &ClientId) -> Option<f64> {
        let bucket = self.store.get(client)?;
        let mut bucket = bucket.lock();
        bucket.refill(self.clock.now());
        Some(bucket.available())
    }

    /// Drop buckets that have refilled to capacity.
    pub fn evict_idle(&self) -> usize {
        self.store.evict_idle(self.clock.now())
    }

    pub fn name(&self) -> &str {
        &self.tier.name
    }

    pub fn settings(&self) -> &TierSettings {
        &self.tier
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    /// Number of clients with a bucket in this tier.
    pub fn client_count(&self) -> usize {
        self.store.len()
    }

    pub(crate) fn bucket(&self, client: &ClientId, now: Timestamp) -> SharedBucket {
        self.store.get_or_create(client, self.tier.bucket, now)
    }

    pub(crate) fn denial_reason(&self, available: f64, cost: f64) -> String {
        let capacity = self.tier.bucket.capacity();
        if cost > capacity {
            format!(
                "tier '{}' can never admit {} tokens: capacity is {}",
                self.tier.name, cost, capacity
            )
        } else {
            format!(
                "tier '{}' exhausted: {:.3} of {} tokens available, {} requested",
                self.tier.name, available, capacity, cost
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::bucket::TokenBucket;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(capacity: f64, rate: f64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_unix_millis(0));
        let tier = TierSettings::new("test", capacity, rate).unwrap();
        (RateLimiter::new(tier, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let (limiter, _clock) = limiter(10.0, 1.0);
        assert_eq!(limiter.client_count(), 0);
        assert_eq!(limiter.name(), "test");
    }

    #[test]
    fn test_tier_settings_validation() {
        assert!(TierSettings::new("", 10.0, 1.0).is_err());
        assert!(TierSettings::new("t", 0.0, 1.0).is_err());
        assert!(TierSettings::new("t", 10.0, -1.0).is_err());
        assert!(TierSettings::per_window("t", 10, Duration::ZERO).is_err());
        assert!(TierSettings::per_window("t", 0, Duration::from_secs(1)).is_err());

        let per_minute = TierSettings::per_window("per-minute", 120, Duration::from_secs(60)).unwrap();
        assert_eq!(per_minute.bucket().capacity(), 120.0);
        assert_eq!(per_minute.bucket().refill_rate_per_second(), 2.0);
    }

    #[test]
    fn test_try_acquire_creates_bucket() {
        let (limiter, _clock) = limiter(10.0, 1.0);
        let client = ClientId::new("alice");

        let result = limiter.try_acquire_one(&client).unwrap();

        assert!(result.is_allowed());
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.available(&client), Some(9.0));
    }

    #[test]
    fn test_invalid_cost_rejected_without_creating_bucket() {
        let (limiter, _clock) = limiter(10.0, 1.0);
        let client = ClientId::new("alice");

        assert!(matches!(limiter.try_acquire(&client, 0.0), Err(TollgateError::InvalidCost(_))));
        assert!(matches!(limiter.try_acquire(&client, -1.0), Err(TollgateError::InvalidCost(_))));
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_burst_then_exhaust_then_refill() {
        let (limiter, clock) = limiter(10.0, 1.0);
        let client = ClientId::new("alice");

        let token = limiter.try_acquire(&client, 10.0).unwrap().into_token().unwrap();
        assert_eq!(token.remaining_tokens(), 0.0);
        assert_eq!(token.client_id(), &client);

        match limiter.try_acquire_one(&client).unwrap() {
            RateLimitResult::Denied { remaining_tokens, retry_after, reason } => {
                assert_eq!(remaining_tokens, 0.0);
                assert_eq!(retry_after, Timestamp::from_unix_millis(1_000));
                assert!(reason.contains("tier 'test'"));
            }
            other => panic!("expected denial, got {:?}", other),
        }

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire_one(&client).unwrap().is_allowed());
    }

    #[test]
    fn test_clients_have_separate_buckets() {
        let (limiter, _clock) = limiter(5.0, 1.0);
        let alice = ClientId::new("alice");
        let bob = ClientId::new("bob");

        limiter.try_acquire(&alice, 5.0).unwrap();
        limiter.try_acquire(&bob, 3.0).unwrap();

        assert_eq!(limiter.available(&alice), Some(0.0));
        assert_eq!(limiter.available(&bob), Some(2.0));
        assert!(!limiter.try_acquire_one(&alice).unwrap().is_allowed());
        assert!(limiter.try_acquire_one(&bob).unwrap().is_allowed());
    }

    #[test]
    fn test_token_ttl() {
        let (limiter, _clock) = limiter(5.0, 1.0);
        let limiter = limiter.with_token_ttl(Duration::from_millis(250));

        let token = limiter.try_acquire_one(&ClientId::new("alice")).unwrap().into_token().unwrap();
        assert_eq!(token.expires_at(), Timestamp::from_unix_millis(250));
    }

    #[test]
    fn test_concurrent_first_use() {
        let (limiter, _clock) = limiter(50.0, 0.001);
        let client = ClientId::new("brand-new");

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|_| scope.spawn(|| limiter.try_acquire_one(&client).unwrap().is_allowed()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(allowed, 50);
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.store().created_count(), 1);
        assert_eq!(limiter.available(&client), Some(0.0));
    }

    #[test]
    fn test_cost_above_capacity_is_never_admitted() {
        let (limiter, clock) = limiter(10.0, 1.0);
        let client = ClientId::new("alice");

        match limiter.try_acquire(&client, 20.0).unwrap() {
            RateLimitResult::Denied { remaining_tokens, retry_after, reason } => {
                assert_eq!(remaining_tokens, 10.0);
                assert_eq!(retry_after, Timestamp::MAX);
                assert!(reason.contains("can never admit"));
            }
            other => panic!("expected denial, got {:?}", other),
        }

        clock.advance(Duration::from_secs(3600));
        assert!(!limiter.try_acquire(&client, 20.0).unwrap().is_allowed());
        assert_eq!(limiter.available(&client), Some(10.0));
    }

    /// A registry that serializes every lookup behind one lock.
    #[derive(Debug, Default)]
    struct LockedRegistry {
        buckets: Mutex<HashMap<ClientId, SharedBucket>>,
        created: AtomicUsize,
    }

    impl BucketRegistry for LockedRegistry {
        fn get_or_create(&self, client: &ClientId, settings: BucketSettings, now: Timestamp) -> SharedBucket {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(client.clone()).or_insert_with(|| {
                self.created.fetch_add(1, Ordering::SeqCst);
                Arc::new(Mutex::new(TokenBucket::with_settings(settings, now)))
            });
            Arc::clone(bucket)
        }

        fn get(&self, client: &ClientId) -> Option<SharedBucket> {
            self.buckets.lock().get(client).cloned()
        }

        fn evict_idle(&self, now: Timestamp) -> usize {
            let mut buckets = self.buckets.lock();
            let before = buckets.len();
            buckets.retain(|_, bucket| {
                let mut bucket = bucket.lock();
                bucket.refill(now);
                !bucket.is_full()
            });
            before - buckets.len()
        }

        fn len(&self) -> usize {
            self.buckets.lock().len()
        }
    }

    #[test]
    fn test_limiter_runs_on_another_registry() {
        let clock = ManualClock::new(Timestamp::from_unix_millis(0));
        let tier = TierSettings::new("custom", 50.0, 0.001).unwrap();
        let limiter = RateLimiter::with_registry(tier, LockedRegistry::default(), Arc::new(clock.clone()));
        let client = ClientId::new("brand-new");

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|_| scope.spawn(|| limiter.try_acquire_one(&client).unwrap().is_allowed()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(allowed, 50);
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.store().created.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(50_000));
        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_evict_idle() {
        let (limiter, clock) = limiter(2.0, 1.0);
        limiter.try_acquire(&ClientId::new("alice"), 2.0).unwrap();
        limiter.try_acquire(&ClientId::new("bob"), 1.0).unwrap();

        assert_eq!(limiter.evict_idle(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.evict_idle(), 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.client_count(), 0);
    }
}
