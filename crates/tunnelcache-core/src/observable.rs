//! Observable value holder with replay-on-subscribe.
//!
//! Subscribing delivers the current value synchronously, on the caller's
//! thread, before `subscribe` returns. Later changes are delivered by whoever
//! calls [`Observable::set`]; inside this crate that is always the owning
//! cache's orchestration task, so updates for one holder never interleave.
//!
//! Every value carries a version. Each listener remembers the newest version
//! it was handed and ignores anything older, so a replay racing a concurrent
//! `set` can never deliver a stale snapshot after the new value.

use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by `subscribe`, used to detach the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Listener<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

struct Subscriber<T> {
    listener: Listener<T>,
    /// Newest version delivered so far, held across the listener call
    delivered: Mutex<u64>,
}

impl<T> Subscriber<T> {
    fn deliver(&self, version: u64, value: Option<&T>) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if version <= *delivered {
            return;
        }
        *delivered = version;
        (self.listener)(value);
    }
}

struct Registry<T> {
    value: Option<T>,
    version: u64,
    subscribers: Vec<(SubscriptionId, Arc<Subscriber<T>>)>,
    next_id: u64,
}

pub struct Observable<T> {
    registry: Mutex<Registry<T>>,
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: Option<T>) -> Self {
        Self {
            registry: Mutex::new(Registry {
                value: initial,
                version: 1,
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        // A listener panicking must not wedge the holder for everyone else
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current value
    pub fn get(&self) -> Option<T> {
        self.lock().value.clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber {
            listener: Arc::new(listener) as Listener<T>,
            delivered: Mutex::new(0),
        });
        let (id, version, snapshot) = {
            let mut registry = self.lock();
            let id = SubscriptionId(registry.next_id);
            registry.next_id += 1;
            registry.subscribers.push((id, Arc::clone(&subscriber)));
            (id, registry.version, registry.value.clone())
        };

        // Called outside the registry lock so the listener may subscribe or
        // unsubscribe. A concurrent `set` that got here first wins.
        subscriber.deliver(version, snapshot.as_ref());
        id
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(existing, _)| *existing != id);
        registry.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Replace the value and notify every listener attached at this moment.
    pub(crate) fn set(&self, value: Option<T>) {
        let (version, subscribers): (u64, Vec<Arc<Subscriber<T>>>) = {
            let mut registry = self.lock();
            registry.value = value.clone();
            registry.version += 1;
            let subscribers = registry
                .subscribers
                .iter()
                .map(|(_, subscriber)| Arc::clone(subscriber))
                .collect();
            (registry.version, subscribers)
        };

        for subscriber in subscribers {
            subscriber.deliver(version, value.as_ref());
        }
    }

    pub(crate) fn clear_listeners(&self) {
        self.lock().subscribers.clear();
    }
}

impl<T: Clone> Default for Observable<T> {
    fn default() -> Self {
        Self::new(None)
    }
}
