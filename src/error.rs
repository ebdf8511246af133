//! Error types for Tollgate.

use thiserror::Error;

use crate::client::ClientId;
use crate::clock::Timestamp;

/// Main error type for Tollgate operations.
///
/// Running out of tokens or quota is not an error: those outcomes are
/// reported as `Denied`/`Exceeded` results.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A limiter or quota was constructed with unusable settings
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A consume call asked for a non-positive or non-finite cost
    #[error("Invalid cost: {0} (must be positive and finite)")]
    InvalidCost(f64),

    /// A quota consume call asked for zero units
    #[error("Invalid units: {0} (must be positive)")]
    InvalidUnits(u64),

    /// Proof tokens presented together belong to different clients
    #[error("Token client mismatch: rate limit token for '{rate_limit}', quota token for '{quota}'")]
    ClientMismatch { rate_limit: ClientId, quota: ClientId },

    /// A proof token was presented after it expired
    #[error("Expired admission for '{client}': valid until {expired_at}")]
    ExpiredToken { client: ClientId, expired_at: Timestamp },

    /// The state store kept rejecting compare-and-swap updates
    #[error("Storage contention: gave up after {0} compare-and-swap attempts")]
    StorageContention(usize),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
