use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::cache::{CacheBuilder, FetchHandlers, RetryingFetchCache};
use crate::observable::SubscriptionId;

/// A fetch cache whose subject is identified by a key, such as an account
/// token.
///
/// Every `fetch` supersedes the previous one, even for the same key. Switching
/// to a different key also clears the value, so observers never see data for
/// one key while another is being resolved.
pub struct KeyedResolver<K, T> {
    cache: RetryingFetchCache<K, T>,
    current_key: Mutex<Option<K>>,
}

impl<K, T> KeyedResolver<K, T>
where
    K: Clone + Debug + PartialEq + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Build the underlying cache. The builder's `on_update` callback is the
    /// channel other components use to learn about new values.
    pub fn new(builder: CacheBuilder<K, T>) -> Self {
        Self {
            cache: builder.build(),
            current_key: Mutex::new(None),
        }
    }

    fn key_guard(&self) -> MutexGuard<'_, Option<K>> {
        self.current_key.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fetch(&self, key: K, handlers: FetchHandlers<T>) {
        let mut current = self.key_guard();
        if let Some(previous) = current.as_ref() {
            if *previous != key {
                debug!(?previous, ?key, "Subject changed, clearing cached value");
                self.cache.replace(None);
            }
        }
        *current = Some(key.clone());
        self.cache.fetch(key, handlers);
    }

    /// Stop the active sequence but keep the current key and value
    pub fn cancel(&self) {
        self.cache.cancel();
    }

    /// Forget the current key and clear the value
    pub fn invalidate(&self) {
        let mut current = self.key_guard();
        if current.take().is_some() {
            debug!("Invalidating keyed cache");
        }
        self.cache.replace(None);
    }

    pub fn current_key(&self) -> Option<K> {
        self.key_guard().clone()
    }

    pub fn value(&self) -> Option<T> {
        self.cache.value()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.cache.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}
