//! Rate limiter trait for abstracting single-tier and hierarchical limiters.

use super::hierarchical::HierarchicalRateLimiter;
use super::limiter::{RateLimitResult, RateLimiter};
use super::store::BucketRegistry;
use crate::client::ClientId;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the single-tier `RateLimiter` and the
/// `HierarchicalRateLimiter` so that callers can work with either.
pub trait AdmissionBackend: Send + Sync {
    /// Try to spend `cost` tokens for `client`.
    fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult>;

    /// Drop buckets that have refilled to capacity. Returns how many.
    fn evict_idle(&self) -> usize;

    /// Number of clients tracked (the largest count across tiers).
    fn tracked_clients(&self) -> usize;
}

impl<R: BucketRegistry> AdmissionBackend for RateLimiter<R> {
    fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult> {
        RateLimiter::try_acquire(self, client, cost)
    }

    fn evict_idle(&self) -> usize {
        RateLimiter::evict_idle(self)
    }

    fn tracked_clients(&self) -> usize {
        self.client_count()
    }
}

impl<R: BucketRegistry> AdmissionBackend for HierarchicalRateLimiter<R> {
    fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult> {
        HierarchicalRateLimiter::try_acquire(self, client, cost)
    }

    fn evict_idle(&self) -> usize {
        HierarchicalRateLimiter::evict_idle(self)
    }

    fn tracked_clients(&self) -> usize {
        self.tiers()
            .iter()
            .map(RateLimiter::client_count)
            .max()
            .unwrap_or(0)
    }
}
