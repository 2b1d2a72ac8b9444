//! Retrying, cancellable fetch cache.
//!
//! This module provides `RetryingFetchCache`, which resolves a volatile value
//! through a caller-supplied asynchronous fetch operation:
//! - at most one attempt sequence is active per cache
//! - failed attempts are retried on a `BackoffSchedule` while the caller says so
//! - a newer `fetch` or `cancel` supersedes older work, and superseded results
//!   never reach the value or any handler
//! - observers are notified on the cache's own task, in order
//!
//! `KeyedResolver` and `StateGatedResolver` in `crate::resolver` build on it.

mod attempt;
pub mod handlers;
pub mod retrying;

pub use attempt::FetchOperation;
pub use handlers::{FetchHandlers, RetryAction};
pub use retrying::{CacheBuilder, Gate, RetryingFetchCache, UpdateCallback};
