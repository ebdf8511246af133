//! The admission surface exposed to integrating services.
//!
//! Rate limiting and quota accounting stay independent: a service decides
//! which of the two a protected operation needs, and combines the tokens
//! with [`AdmissionPass`] when it needs both.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::ClientId;
use crate::clock::Clock;
use crate::config::TollgateConfig;
use crate::error::Result;
use crate::quota::{QuotaManager, QuotaResult};
use crate::ratelimit::{AdmissionBackend, HierarchicalRateLimiter, RateLimitResult, RateLimiter};
use crate::token::AdmissionPass;

/// Owns the configured rate limiter and quota manager.
pub struct AdmissionController {
    limiter: Box<dyn AdmissionBackend>,
    quota: QuotaManager,
}

impl AdmissionController {
    /// Create a controller from its parts.
    pub fn new(limiter: Box<dyn AdmissionBackend>, quota: QuotaManager) -> Self {
        Self { limiter, quota }
    }

    /// Build a controller from configuration.
    ///
    /// All settings are validated here. A single tier gets a plain
    /// `RateLimiter`; several tiers are composed hierarchically.
    pub fn from_config(config: &TollgateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let ttl = config.tokens.ttl();
        let mut tiers = config.tier_settings()?;

        let limiter: Box<dyn AdmissionBackend> = if tiers.len() == 1 {
            let tier = tiers.remove(0);
            Box::new(RateLimiter::new(tier, clock.clone()).with_token_ttl(ttl))
        } else {
            Box::new(HierarchicalRateLimiter::new(tiers, clock.clone())?.with_token_ttl(ttl))
        };

        let quota = QuotaManager::new(config.quota_settings()?, clock).with_token_ttl(ttl);

        info!(
            tiers = config.tiers.len(),
            quota_units = config.quota.units_limit,
            quota_period_secs = config.quota.period_secs,
            token_ttl_ms = config.tokens.ttl_ms,
            "Admission controller initialized"
        );
        Ok(Self::new(limiter, quota))
    }

    /// Try to spend `cost` rate limit tokens for `client`.
    pub fn try_acquire(&self, client: &ClientId, cost: f64) -> Result<RateLimitResult> {
        self.limiter.try_acquire(client, cost)
    }

    /// Try to spend a single rate limit token for `client`.
    pub fn try_acquire_one(&self, client: &ClientId) -> Result<RateLimitResult> {
        self.try_acquire(client, 1.0)
    }

    /// Try to record `units` of quota usage for `client`.
    pub async fn try_consume_quota(&self, client: &ClientId, units: u64) -> Result<QuotaResult> {
        self.quota.try_consume(client, units).await
    }

    /// Try to record a single unit of quota usage for `client`.
    pub async fn try_consume_quota_one(&self, client: &ClientId) -> Result<QuotaResult> {
        self.try_consume_quota(client, 1).await
    }

    /// Run both checks and pair the proofs.
    ///
    /// Returns `Ok(None)` if either check refuses. The rate limit is checked
    /// first; if it refuses, no quota is recorded. A quota refusal after an
    /// admitted rate limit check does not give the rate limit tokens back.
    pub async fn admit(&self, client: &ClientId, cost: f64, units: u64) -> Result<Option<AdmissionPass>> {
        let Some(rate_limit) = self.try_acquire(client, cost)?.into_token() else {
            return Ok(None);
        };
        let Some(quota) = self.try_consume_quota(client, units).await?.into_token() else {
            debug!(client = %client, "Rate limit admitted but quota refused");
            return Ok(None);
        };
        AdmissionPass::new(rate_limit, quota).map(Some)
    }

    /// Drop idle rate limit buckets. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        self.limiter.evict_idle()
    }

    /// Number of clients with rate limit state.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.tracked_clients()
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }
}
