//! tunnelcache-core - keeps volatile daemon-provided values resolved.
//!
//! The heart of the crate is [`RetryingFetchCache`]: it runs a caller-supplied
//! fetch operation, retries failures on a [`BackoffSchedule`], lets at most one
//! attempt sequence be active at a time, and drops results from sequences that
//! have been superseded. Observers see every change, in order, and get the
//! current value replayed when they subscribe.
//!
//! Two resolvers build on it:
//! - [`KeyedResolver`] (used for account data) restarts on every `fetch`
//! - [`StateGatedResolver`] (used for location) follows the tunnel state and
//!   connectivity, deriving a value whenever a lookup would be meaningless

pub mod backoff;
pub mod cache;
pub mod daemon;
pub mod error;
pub mod models;
pub mod observable;
pub mod resolver;
pub mod settings;

pub use backoff::BackoffSchedule;
pub use cache::{FetchHandlers, FetchOperation, RetryAction, RetryingFetchCache};
pub use daemon::DaemonRpc;
pub use error::{FetchError, SettingsError};
pub use observable::{Observable, SubscriptionId};
pub use resolver::{
    account_data_cache, location_resolver, AccountDataCache, KeyedResolver, LocationPolicy,
    LocationResolver, StateGatedResolver, StatePolicy,
};
pub use settings::Settings;
