//! Continuous-refill token bucket.

use std::time::Duration;

use crate::clock::Timestamp;
use crate::error::{Result, TollgateError};

/// Validated capacity and refill rate for a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSettings {
    capacity: f64,
    refill_rate_per_second: f64,
}

impl BucketSettings {
    /// Validate and create bucket settings.
    ///
    /// Both values must be positive and finite.
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Result<Self> {
        if !(capacity > 0.0 && capacity.is_finite()) {
            return Err(TollgateError::InvalidConfiguration(format!(
                "capacity must be positive and finite, got {}",
                capacity
            )));
        }
        if !(refill_rate_per_second > 0.0 && refill_rate_per_second.is_finite()) {
            return Err(TollgateError::InvalidConfiguration(format!(
                "refill rate must be positive and finite, got {}",
                refill_rate_per_second
            )));
        }
        Ok(Self {
            capacity,
            refill_rate_per_second,
        })
    }

    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Time for an empty bucket to refill completely.
    pub fn time_to_full(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.refill_rate_per_second)
    }
}

/// Result of a consume attempt against a single bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsumeOutcome {
    /// The cost was deducted; `remaining` tokens are left.
    Success { remaining: f64 },
    /// Not enough tokens; `deficit` more would have been needed.
    Failure { deficit: f64 },
}

/// One client's allowance for one tier.
///
/// The balance is kept as an `f64` and the refill timestamp advances on
/// every refill, so fractional progress accumulates across calls even when
/// the refill rate is below one token per second.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    settings: BucketSettings,
    available: f64,
    last_refill_at: Timestamp,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_rate_per_second: f64, now: Timestamp) -> Result<Self> {
        let settings = BucketSettings::new(capacity, refill_rate_per_second)?;
        Ok(Self::with_settings(settings, now))
    }

    /// Create a full bucket from already-validated settings.
    pub fn with_settings(settings: BucketSettings, now: Timestamp) -> Self {
        Self {
            settings,
            available: settings.capacity,
            last_refill_at: now,
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    ///
    /// A `now` earlier than the last refill credits nothing. The refill
    /// timestamp always moves to `now`, so after a backward clock step the
    /// bucket refills again as soon as time moves forward from the new
    /// reading.
    pub fn refill(&mut self, now: Timestamp) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.available = (self.available
            + elapsed.as_secs_f64() * self.settings.refill_rate_per_second)
            .min(self.settings.capacity);
        self.last_refill_at = now;
    }

    /// Refill, then deduct `cost` if the balance covers it.
    pub fn try_consume(&mut self, cost: f64, now: Timestamp) -> Result<ConsumeOutcome> {
        validate_cost(cost)?;
        self.refill(now);

        if self.available >= cost {
            self.available -= cost;
            Ok(ConsumeOutcome::Success {
                remaining: self.available,
            })
        } else {
            Ok(ConsumeOutcome::Failure {
                deficit: cost - self.available,
            })
        }
    }

    /// Return tokens taken by a consume that is being rolled back.
    pub(crate) fn refund(&mut self, cost: f64) {
        self.available = (self.available + cost).min(self.settings.capacity);
    }

    /// Earliest time the balance could cover `cost`, assuming nobody else
    /// draws from this bucket in the meantime.
    ///
    /// A cost above capacity can never be covered and yields
    /// [`Timestamp::MAX`].
    pub fn retry_after(&self, cost: f64, now: Timestamp) -> Timestamp {
        if !self.can_ever_cover(cost) {
            return Timestamp::MAX;
        }
        let deficit = (cost - self.available).max(0.0);
        now.add_secs_f64(deficit / self.settings.refill_rate_per_second)
    }

    /// Whether `cost` fits in this bucket at all.
    pub fn can_ever_cover(&self, cost: f64) -> bool {
        cost <= self.settings.capacity
    }

    /// Token balance as of the last refill.
    pub fn available(&self) -> f64 {
        self.available
    }

    /// Maximum tokens this bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.settings.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate_per_second(&self) -> f64 {
        self.settings.refill_rate_per_second
    }

    /// When the balance was last brought up to date.
    pub fn last_refill_at(&self) -> Timestamp {
        self.last_refill_at
    }

    /// Whether the bucket is at capacity as of the last refill.
    pub fn is_full(&self) -> bool {
        self.available >= self.settings.capacity
    }
}

/// Reject costs that are zero, negative, NaN or infinite.
pub(crate) fn validate_cost(cost: f64) -> Result<()> {
    if cost > 0.0 && cost.is_finite() {
        Ok(())
    } else {
        Err(TollgateError::InvalidCost(cost))
    }
}
