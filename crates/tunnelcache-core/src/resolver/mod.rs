//! Resolvers built on top of `RetryingFetchCache`.
//!
//! - `KeyedResolver`: one subject per key; a new `fetch` always restarts
//! - `StateGatedResolver`: fetches only while an external state machine and
//!   connectivity allow it, and derives a value from state otherwise
//!
//! `location` and `account` wire these to the daemon for the two values the
//! client keeps resolved: the device's public location and account expiry.

pub mod account;
pub mod keyed;
pub mod location;
pub mod state_gated;

pub use account::{account_data_cache, AccountDataCache};
pub use keyed::KeyedResolver;
pub use location::{location_resolver, LocationPolicy, LocationResolver};
pub use state_gated::{StateGatedResolver, StatePolicy};
