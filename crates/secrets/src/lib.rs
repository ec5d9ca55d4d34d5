//! Remote secret resolution for database credentials.
//!
//! This crate provides:
//! - `SecretStore` trait for pluggable secret backends
//! - AWS SSM Parameter Store implementation
//! - `SecretFetcher`, a process-wide TTL cache that coalesces concurrent misses
//! - `Clock` trait so cache expiry can be driven deterministically in tests

pub mod clock;
pub mod error;
pub mod fetcher;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SecretError;
pub use fetcher::{CoalesceScope, SecretFetcher, SecretFetcherBuilder, CACHE_TTL, FETCH_TIMEOUT};
pub use store::{SecretStore, SsmParameterStore};
