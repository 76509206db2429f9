//! Azure Resource Manager client for the azclone engine.
//!
//! Implements the `CloudClient` trait over the ARM REST surface:
//! resource-graph queries with skip-token pagination, provider metadata
//! lookups with a per-namespace cache, resource-group upserts, and the
//! deployment validate/submit/poll/cancel cycle. Requests flow through
//! per-service token buckets and a circuit breaker; transient failures are
//! retried with exponential backoff and jitter.

pub mod client;
pub mod limits;

pub use client::ArmClient;
pub use limits::{CircuitBreaker, RateLimiter, Service};
