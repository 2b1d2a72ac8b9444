//! The daemon's RPC surface as seen by the resolvers.
//!
//! Transport is someone else's problem: anything that can answer these two
//! questions asynchronously can back a location resolver and an account data
//! cache.

use futures::future::BoxFuture;

use crate::error::FetchError;
use crate::models::{AccountData, AccountToken, GeoIpLocation};

pub trait DaemonRpc: Send + Sync + 'static {
    /// Look up where the device currently appears to be
    fn current_location(&self) -> BoxFuture<'static, Result<GeoIpLocation, FetchError>>;

    /// Fetch account data (expiry) for an account token
    fn account_data(&self, token: AccountToken)
        -> BoxFuture<'static, Result<AccountData, FetchError>>;
}
