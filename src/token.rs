//! Proof-of-admission tokens.
//!
//! A [`RateLimitToken`] or [`QuotaToken`] can only be obtained from a
//! successful check: their constructors are private to this crate and they
//! cannot be deserialized. Protected operations take a token (or an
//! [`AdmissionPass`]) as a parameter, so calling one without passing the
//! limiter first does not compile.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::client::ClientId;
use crate::clock::Timestamp;
use crate::error::{Result, TollgateError};
use crate::quota::QuotaRecord;

/// Default lifetime of an issued token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(1);

/// Mints proof tokens on the success paths of the limiters and quota manager.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TokenIssuer {
    ttl: Duration,
}

impl TokenIssuer {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub(crate) fn rate_limit_token(
        &self,
        client: &ClientId,
        now: Timestamp,
        remaining_tokens: f64,
    ) -> RateLimitToken {
        RateLimitToken {
            id: Uuid::new_v4(),
            client_id: client.clone(),
            granted_at: now,
            expires_at: now + self.ttl,
            remaining_tokens,
        }
    }

    pub(crate) fn quota_token(&self, record: &QuotaRecord, units: u64, now: Timestamp) -> QuotaToken {
        QuotaToken {
            id: Uuid::new_v4(),
            client_id: record.client_id().clone(),
            granted_at: now,
            expires_at: now + self.ttl,
            units,
            units_used: record.units_used(),
            units_limit: record.units_limit(),
            period_end: record.period_end(),
        }
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

/// Proof that a rate limit check admitted a request.
#[derive(Debug, Serialize)]
pub struct RateLimitToken {
    id: Uuid,
    client_id: ClientId,
    granted_at: Timestamp,
    expires_at: Timestamp,
    remaining_tokens: f64,
}

impl RateLimitToken {
    /// Unique id of this grant.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The client that was admitted.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// When the check passed.
    pub fn granted_at(&self) -> Timestamp {
        self.granted_at
    }

    /// When this proof stops being accepted.
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Tokens left after this grant (the smallest balance across tiers).
    pub fn remaining_tokens(&self) -> f64 {
        self.remaining_tokens
    }

    /// Whether the token has not yet expired at `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Proof that a quota check admitted a request.
#[derive(Debug, Serialize)]
pub struct QuotaToken {
    id: Uuid,
    client_id: ClientId,
    granted_at: Timestamp,
    expires_at: Timestamp,
    units: u64,
    units_used: u64,
    units_limit: u64,
    period_end: Timestamp,
}

impl QuotaToken {
    /// Unique id of this grant.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The client that was admitted.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// When the check passed.
    pub fn granted_at(&self) -> Timestamp {
        self.granted_at
    }

    /// When this proof stops being accepted.
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Units granted by this token.
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Units used in the period, including this grant.
    pub fn units_used(&self) -> u64 {
        self.units_used
    }

    /// Units allowed per period.
    pub fn units_limit(&self) -> u64 {
        self.units_limit
    }

    /// Units still available in the period after this grant.
    pub fn units_remaining(&self) -> u64 {
        self.units_limit.saturating_sub(self.units_used)
    }

    /// When the quota period containing this grant ends.
    pub fn period_end(&self) -> Timestamp {
        self.period_end
    }

    /// Whether the token has not yet expired at `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Check that two independently issued tokens were granted to one client.
pub fn verify_same_client(rate_limit: &RateLimitToken, quota: &QuotaToken) -> Result<()> {
    if rate_limit.client_id == quota.client_id {
        Ok(())
    } else {
        Err(TollgateError::ClientMismatch {
            rate_limit: rate_limit.client_id.clone(),
            quota: quota.client_id.clone(),
        })
    }
}

/// Both proofs for one client, cross-checked.
///
/// Operations that need rate limit and quota admission take this type.
#[derive(Debug, Serialize)]
pub struct AdmissionPass {
    rate_limit: RateLimitToken,
    quota: QuotaToken,
}

impl AdmissionPass {
    /// Pair the two tokens, rejecting them if they name different clients.
    pub fn new(rate_limit: RateLimitToken, quota: QuotaToken) -> Result<Self> {
        verify_same_client(&rate_limit, &quota)?;
        Ok(Self { rate_limit, quota })
    }

    /// The admitted client.
    pub fn client_id(&self) -> &ClientId {
        &self.rate_limit.client_id
    }

    pub fn rate_limit(&self) -> &RateLimitToken {
        &self.rate_limit
    }

    pub fn quota(&self) -> &QuotaToken {
        &self.quota
    }

    /// Whether both tokens are still valid at `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.rate_limit.is_valid_at(now) && self.quota.is_valid_at(now)
    }

    /// When the first of the two tokens expires.
    pub fn expires_at(&self) -> Timestamp {
        self.rate_limit.expires_at.min(self.quota.expires_at)
    }

    /// Reject the pass if either token has expired at `now`.
    ///
    /// Protected operations call this before doing any work.
    pub fn ensure_valid_at(&self, now: Timestamp) -> Result<()> {
        if self.is_valid_at(now) {
            Ok(())
        } else {
            Err(TollgateError::ExpiredToken {
                client: self.client_id().clone(),
                expired_at: self.expires_at(),
            })
        }
    }

    pub fn into_parts(self) -> (RateLimitToken, QuotaToken) {
        (self.rate_limit, self.quota)
    }
}
