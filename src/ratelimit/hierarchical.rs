//! Multi-tier rate limiting with all-or-nothing consumption.
//!
//! A request is admitted only if every tier can pay its cost, and then every
//! tier pays. Admission runs in two phases:
//!
//! 1. **Peek**: each tier's bucket is refilled and checked under its own
//!    lock, without deducting anything. Any shortfall denies the request
//!    and leaves every bucket untouched.
//! 2. **Commit**: each tier's bucket is consumed in turn. Another request
//!    may have drained a tier between the two phases; if a commit fails,
//!    the tiers already charged in this pass are refunded before denying.
//!
//! At most one bucket lock is held at any time, so tiers never deadlock
//! against each other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::bucket::{validate_cost, ConsumeOutcome};
use super::limiter::{RateLimitResult, RateLimiter, TierSettings};
use super::store::{BucketRegistry, BucketStore, SharedBucket};
use crate::client::ClientId;
use crate::clock::{Clock, Timestamp};
use crate::error::{Result, TollgateError};
use crate::token::TokenIssuer;

/// A tier that could not cover a request.
#[derive(Debug)]
struct Shortfall<'a, R> {
    tier: &'a RateLimiter<R>,
    available: f64,
    retry_after: Timestamp,
}

/// Outcome of the commit phase.
#[derive(Debug)]
enum Commit<'a, R> {
    Done { remaining: f64 },
    Aborted(Shortfall<'a, R>),
}

/// Composes several independent tiers into one admission decision.
///
/// Each tier keeps its buckets in its own [`BucketRegistry`].
#[derive(Debug)]
pub struct HierarchicalRateLimiter<R = BucketStore> {
    tiers: Vec<RateLimiter<R>>,
    clock: Arc<dyn Clock>,
    issuer: TokenIssuer,
}

impl HierarchicalRateLimiter {
    /// Create a limiter from one or more uniquely named tiers, each backed
    /// by a fresh `BucketStore`.
    pub fn new(tiers: Vec<TierSettings>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_registries(tiers, clock, |_| BucketStore::new())
    }
}

impl<R> HierarchicalRateLimiter<R>
where
    R: BucketRegistry,
{
    /// Create a limiter whose tiers keep their buckets in the registries
    /// built by `registry`, called once per tier.
    pub fn with_registries<F>(tiers: Vec<TierSettings>, clock: Arc<dyn Clock>, mut registry: F) -> Result<Self>
    where
        F: FnMut(&TierSettings) -> R,
    {
        if tiers.is_empty() {
            return Err(TollgateError::InvalidConfiguration(
                "at least one tier is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tier in &tiers {
            if !names.insert(tier.name().to_string()) {
                return Err(TollgateError::InvalidConfiguration(format!(
                    "duplicate tier name '{}'",
                    tier.name()
                )));
            }
        }

        let tiers = tiers
            .into_iter()
            .map(|tier| {
                let store = registry(&tier);
                RateLimiter::with_registry(tier, store, clock.clone())
            })
            .collect();

        Ok(Self {
            tiers,
            clock,
            issuer: TokenIssuer::default(),
        })
    }

    /// Set how long issued tokens stay valid.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.issuer = TokenIssuer::new(ttl);
        self
    }

    /// Try to spend `cost` tokens from every tier, or from none.
    pub fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult> {
        validate_cost(cost)?;
        let now = self.clock.now();

        trace!(
            client = %client,
            cost = cost,
            tiers = self.tiers.len(),
            "Checking hierarchical rate limit"
        );

        let buckets: Vec<(&RateLimiter<R>, SharedBucket)> = self
            .tiers
            .iter()
            .map(|tier| (tier, tier.bucket(client, now)))
            .collect();

        let shortfalls = Self::peek(&buckets, cost, now);
        if let Some(worst) = shortfalls.iter().max_by_key(|shortfall| shortfall.retry_after) {
            return Ok(self.deny(client, cost, worst, shortfalls.len()));
        }

        match Self::commit(&buckets, cost, now)? {
            Commit::Done { remaining } => Ok(RateLimitResult::Allowed {
                token: self.issuer.rate_limit_token(client, now, remaining),
            }),
            Commit::Aborted(shortfall) => Ok(self.deny(client, cost, &shortfall, 1)),
        }
    }

    /// Try to spend a single token from every tier.
    pub fn try_acquire_one(&self, client: &ClientId) -> Result<RateLimitResult> {
        self.try_acquire(client, 1.0)
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&RateLimiter<R>> {
        self.tiers.iter().find(|tier| tier.name() == name)
    }

    pub fn tiers(&self) -> &[RateLimiter<R>] {
        &self.tiers
    }

    /// Drop idle buckets from every tier.
    pub fn evict_idle(&self) -> usize {
        self.tiers.iter().map(RateLimiter::evict_idle).sum()
    }

    /// Refill and check every tier without deducting anything.
    fn peek<'a>(
        buckets: &[(&'a RateLimiter<R>, SharedBucket)],
        cost: f64,
        now: Timestamp,
    ) -> Vec<Shortfall<'a, R>> {
        let mut shortfalls = Vec::new();
        for (tier, bucket) in buckets {
            let mut bucket = bucket.lock();
            bucket.refill(now);
            if bucket.available() < cost {
                shortfalls.push(Shortfall {
                    tier: *tier,
                    available: bucket.available(),
                    retry_after: bucket.retry_after(cost, now),
                });
            }
        }
        shortfalls
    }

    /// Charge every tier in order, refunding the charged ones if a tier
    /// turns out to have been drained since the peek.
    fn commit<'a>(
        buckets: &[(&'a RateLimiter<R>, SharedBucket)],
        cost: f64,
        now: Timestamp,
    ) -> Result<Commit<'a, R>> {
        let mut remaining = f64::INFINITY;
        for (index, (tier, bucket)) in buckets.iter().enumerate() {
            let mut guard = bucket.lock();
            match guard.try_consume(cost, now)? {
                ConsumeOutcome::Success { remaining: left } => {
                    remaining = remaining.min(left);
                }
                ConsumeOutcome::Failure { .. } => {
                    let shortfall = Shortfall {
                        tier: *tier,
                        available: guard.available(),
                        retry_after: guard.retry_after(cost, now),
                    };
                    drop(guard);

                    Self::roll_back(&buckets[..index], cost);
                    debug!(
                        tier = %tier.name(),
                        refunded_tiers = index,
                        "Tier drained between peek and commit, rolled back"
                    );
                    return Ok(Commit::Aborted(shortfall));
                }
            }
        }
        Ok(Commit::Done { remaining })
    }

    /// Refund tiers already charged in an aborted commit.
    fn roll_back(committed: &[(&RateLimiter<R>, SharedBucket)], cost: f64) {
        for (_, bucket) in committed {
            bucket.lock().refund(cost);
        }
    }

    /// Build a denial citing the tier with the longest wait.
    fn deny(
        &self,
        client: &ClientId,
        cost: f64,
        worst: &Shortfall<'_, R>,
        failing_tiers: usize,
    ) -> RateLimitResult {
        debug!(
            client = %client,
            tier = %worst.tier.name(),
            failing_tiers = failing_tiers,
            available = worst.available,
            cost = cost,
            retry_after = %worst.retry_after,
            "Hierarchical rate limit exceeded"
        );

        RateLimitResult::Denied {
            remaining_tokens: worst.available,
            retry_after: worst.retry_after,
            reason: worst.tier.denial_reason(worst.available, cost),
        }
    }
}
