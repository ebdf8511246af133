//! Tollgate - In-Process Admission Control
//!
//! This crate decides whether a client may proceed: per-client token buckets
//! (optionally stacked into all-or-nothing tiers) smooth request rates, a
//! quota manager caps usage over long periods, and every successful check
//! yields a proof token that protected operations require as a parameter.

pub mod admission;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod ratelimit;
pub mod storage;
pub mod token;

pub use admission::AdmissionController;
pub use client::ClientId;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::{Result, TollgateError};
pub use quota::{QuotaManager, QuotaRecord, QuotaResult, QuotaSettings};
pub use ratelimit::{BucketRegistry, BucketStore, HierarchicalRateLimiter, RateLimitResult, RateLimiter, TierSettings};
pub use token::{AdmissionPass, QuotaToken, RateLimitToken};
