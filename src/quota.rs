//! Long-window usage quotas.
//!
//! Unlike token buckets, a quota does not refill continuously: each client
//! gets `units_limit` units per period, and the whole allowance comes back
//! at once when the period ends.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::client::ClientId;
use crate::clock::{Clock, Timestamp};
use crate::error::{Result, TollgateError};
use crate::storage::{InMemoryStore, StateStore};
use crate::token::{QuotaToken, TokenIssuer};

/// How many times a consume retries after losing a compare-and-swap race.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Validated quota limit and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    units_limit: u64,
    period: Duration,
}

impl QuotaSettings {
    /// Validate and create quota settings. Both values must be non-zero.
    pub fn new(units_limit: u64, period: Duration) -> Result<Self> {
        if units_limit == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "quota units limit must be positive".to_string(),
            ));
        }
        if period.is_zero() {
            return Err(TollgateError::InvalidConfiguration(
                "quota period must be positive".to_string(),
            ));
        }
        Ok(Self {
            units_limit,
            period,
        })
    }

    pub fn units_limit(&self) -> u64 {
        self.units_limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// One client's usage in the current quota period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    client_id: ClientId,
    period_start: Timestamp,
    units_used: u64,
    units_limit: u64,
    period_length: Duration,
}

impl QuotaRecord {
    /// Start a fresh period for `client` at `now`.
    pub fn new(client_id: ClientId, settings: &QuotaSettings, now: Timestamp) -> Self {
        Self {
            client_id,
            period_start: now,
            units_used: 0,
            units_limit: settings.units_limit,
            period_length: settings.period,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn period_start(&self) -> Timestamp {
        self.period_start
    }

    pub fn units_used(&self) -> u64 {
        self.units_used
    }

    pub fn units_limit(&self) -> u64 {
        self.units_limit
    }

    pub fn period_length(&self) -> Duration {
        self.period_length
    }

    /// First instant of the next period.
    pub fn period_end(&self) -> Timestamp {
        self.period_start + self.period_length
    }

    /// Whether `now` falls outside this record's period.
    ///
    /// The end boundary belongs to the next period.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        now >= self.period_end()
    }

    /// Start a new period at `now` if the current one has ended.
    /// Returns whether a reset happened.
    pub fn roll_over(&mut self, now: Timestamp) -> bool {
        if self.is_stale(now) {
            self.period_start = now;
            self.units_used = 0;
            true
        } else {
            false
        }
    }

    /// Whether `units` more fit within the limit.
    pub fn has_room_for(&self, units: u64) -> bool {
        self.units_used
            .checked_add(units)
            .map_or(false, |total| total <= self.units_limit)
    }

    pub(crate) fn record_use(&mut self, units: u64) {
        self.units_used = self.units_used.saturating_add(units);
    }
}

/// Outcome of a quota check.
#[derive(Debug)]
pub enum QuotaResult {
    /// The units were recorded.
    Available { token: QuotaToken },
    /// The request would exceed the period's limit; nothing was recorded.
    Exceeded {
        used: u64,
        limit: u64,
        reset_at: Timestamp,
    },
}

impl QuotaResult {
    pub fn is_available(&self) -> bool {
        matches!(self, QuotaResult::Available { .. })
    }

    /// Take the proof token out of an `Available` result.
    pub fn into_token(self) -> Option<QuotaToken> {
        match self {
            QuotaResult::Available { token } => Some(token),
            QuotaResult::Exceeded { .. } => None,
        }
    }
}

/// Tracks per-client quota usage in a [`StateStore`].
pub struct QuotaManager<S = InMemoryStore<ClientId, QuotaRecord>> {
    settings: QuotaSettings,
    store: S,
    clock: Arc<dyn Clock>,
    issuer: TokenIssuer,
}

impl QuotaManager {
    /// Create a quota manager backed by an in-memory store.
    pub fn new(settings: QuotaSettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(settings, InMemoryStore::new(), clock)
    }
}

impl<S> QuotaManager<S>
where
    S: StateStore<ClientId, QuotaRecord>,
{
    /// Create a quota manager backed by `store`.
    pub fn with_store(settings: QuotaSettings, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            store,
            clock,
            issuer: TokenIssuer::default(),
        }
    }

    /// Set how long issued quota tokens stay valid.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.issuer = TokenIssuer::new(ttl);
        self
    }

    /// Record `units` of usage for `client` if the current period allows it.
    ///
    /// The record is read, updated (resetting it first if its period has
    /// ended), and written back with compare-and-swap; a lost race retries
    /// from a fresh read.
    pub async fn try_consume(&self, client: &ClientId, units: u64) -> Result<QuotaResult> {
        if units == 0 {
            return Err(TollgateError::InvalidUnits(units));
        }

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.get(client).await;
            let mut record = match &current {
                Some(record) => record.clone(),
                None => QuotaRecord::new(client.clone(), &self.settings, now),
            };

            if record.roll_over(now) {
                debug!(
                    client = %client,
                    period_start = %record.period_start(),
                    "Quota period rolled over"
                );
            }

            if !record.has_room_for(units) {
                debug!(
                    client = %client,
                    used = record.units_used(),
                    limit = record.units_limit(),
                    units = units,
                    "Quota exceeded"
                );
                return Ok(QuotaResult::Exceeded {
                    used: record.units_used(),
                    limit: record.units_limit(),
                    reset_at: record.period_end(),
                });
            }

            record.record_use(units);
            if self
                .store
                .compare_and_swap(client, current.as_ref(), record.clone())
                .await
            {
                trace!(
                    client = %client,
                    used = record.units_used(),
                    limit = record.units_limit(),
                    "Quota units recorded"
                );
                return Ok(QuotaResult::Available {
                    token: self.issuer.quota_token(&record, units, now),
                });
            }

            trace!(client = %client, attempt = attempt, "Quota update lost a race, retrying");
        }

        warn!(
            client = %client,
            attempts = MAX_CAS_ATTEMPTS,
            "Giving up on quota update under contention"
        );
        Err(TollgateError::StorageContention(MAX_CAS_ATTEMPTS))
    }

    /// Record a single unit of usage.
    pub async fn try_consume_one(&self, client: &ClientId) -> Result<QuotaResult> {
        self.try_consume(client, 1).await
    }

    /// Current usage for `client`, as it would be seen by the next consume.
    pub async fn usage(&self, client: &ClientId) -> Option<QuotaRecord> {
        let mut record = self.store.get(client).await?;
        record.roll_over(self.clock.now());
        Some(record)
    }

    pub fn settings(&self) -> QuotaSettings {
        self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
