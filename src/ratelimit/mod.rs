//! Token-bucket rate limiting.

mod backend;
mod bucket;
mod hierarchical;
mod limiter;
mod store;

pub use backend::AdmissionBackend;
pub use bucket::{BucketSettings, ConsumeOutcome, TokenBucket};
pub use hierarchical::HierarchicalRateLimiter;
pub use limiter::{RateLimitResult, RateLimiter, TierSettings};
pub use store::{BucketRegistry, BucketStore, SharedBucket};
