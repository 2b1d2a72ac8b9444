use std::sync::Arc;

use crate::backoff::BackoffSchedule;
use crate::cache::RetryingFetchCache;
use crate::daemon::DaemonRpc;
use crate::models::{AccountData, AccountToken};

use super::keyed::KeyedResolver;

pub type AccountDataCache = KeyedResolver<AccountToken, AccountData>;

/// Build an account data cache backed by the daemon.
///
/// `on_update` is called with every successfully fetched `AccountData`.
/// Must be called from within a Tokio runtime.
pub fn account_data_cache<U>(
    daemon: Arc<dyn DaemonRpc>,
    schedule: BackoffSchedule,
    on_update: U,
) -> AccountDataCache
where
    U: Fn(&AccountData) + Send + Sync + 'static,
{
    let builder = RetryingFetchCache::builder("account", move |token: AccountToken| {
        daemon.account_data(token)
    })
    .schedule(schedule)
    .on_update(on_update);

    KeyedResolver::new(builder)
}
