use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::cache::{CacheBuilder, FetchHandlers, RetryAction, RetryingFetchCache};
use crate::error::FetchError;
use crate::observable::SubscriptionId;

/// How a `StateGatedResolver` treats each external state.
pub trait StatePolicy<S, T>: Send + Sync + 'static {
    /// Whether `state` warrants a live fetch (given connectivity)
    fn wants_fetch(&self, state: &S) -> bool;

    /// Value to surface as soon as `state` is entered, without any I/O
    fn derive(&self, state: &S, last_known_good: Option<&T>) -> Option<T>;

    /// Whether a value fetched in `state` becomes the last known good value
    fn remembers(&self, state: &S) -> bool;

    /// Retry policy for failures of fetches started in `state`
    fn on_error(&self, _state: &S, _error: &FetchError) -> RetryAction {
        RetryAction::Retry
    }
}

struct GateState<S> {
    state: S,
    connected: bool,
    /// State the active fetch sequence was launched for
    origin: Option<S>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A fetch cache driven by an externally owned state machine.
///
/// On every state change the resolver decides between fetching and deriving.
/// Fetch-eligible states (with connectivity) launch a fresh sequence keyed by
/// the state itself, unless one for an equal state is already running. Every
/// other state cancels the active sequence and publishes a value derived from
/// the state. Results of sequences launched for an earlier state are dropped
/// by the cache's generation check, so they can never overwrite the value of
/// the current state.
///
/// The gate lock is held while calling into the cache. Fetch handlers only
/// touch `last_known_good`, which has its own lock and is never held across a
/// cache call.
pub struct StateGatedResolver<S, T> {
    cache: RetryingFetchCache<S, T>,
    gate: Arc<Mutex<GateState<S>>>,
    last_known_good: Arc<Mutex<Option<T>>>,
    policy: Arc<dyn StatePolicy<S, T>>,
}

impl<S, T> StateGatedResolver<S, T>
where
    S: Clone + Debug + PartialEq + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<P>(builder: CacheBuilder<S, T>, policy: P, initial: S, connected: bool) -> Self
    where
        P: StatePolicy<S, T>,
    {
        let gate = Arc::new(Mutex::new(GateState {
            state: initial,
            connected,
            origin: None,
        }));
        let policy: Arc<dyn StatePolicy<S, T>> = Arc::new(policy);

        let applicable = {
            let gate = Arc::clone(&gate);
            let policy = Arc::clone(&policy);
            move || {
                let gate = lock(&gate);
                gate.connected && policy.wants_fetch(&gate.state)
            }
        };

        let resolver = Self {
            cache: builder.gate(applicable).build(),
            gate,
            last_known_good: Arc::new(Mutex::new(None)),
            policy,
        };

        {
            let mut gate = lock(&resolver.gate);
            resolver.reevaluate(&mut gate);
        }
        resolver
    }

    /// Push a new external state
    pub fn set_state(&self, state: S) {
        let mut gate = lock(&self.gate);
        trace!(?state, "External state changed");
        gate.state = state;
        self.reevaluate(&mut gate);
    }

    /// Push a connectivity change. Regaining connectivity in a fetch-eligible
    /// state starts a fresh fetch.
    pub fn set_connectivity(&self, connected: bool) {
        let mut gate = lock(&self.gate);
        let regained = connected && !gate.connected;
        gate.connected = connected;

        if regained && self.policy.wants_fetch(&gate.state) {
            debug!(state = ?gate.state, "Connectivity regained, refetching");
            self.launch(&mut gate);
        }
    }

    /// Start a fresh fetch for the current state if fetching is applicable
    pub fn refresh(&self) {
        let mut gate = lock(&self.gate);
        if self.is_applicable(&gate) {
            self.launch(&mut gate);
        }
    }

    fn is_applicable(&self, gate: &GateState<S>) -> bool {
        gate.connected && self.policy.wants_fetch(&gate.state)
    }

    fn reevaluate(&self, gate: &mut GateState<S>) {
        if self.is_applicable(gate) {
            if gate.origin.as_ref() == Some(&gate.state) {
                trace!(state = ?gate.state, "Fetch for this state already active");
                return;
            }
            let provisional = self
                .policy
                .derive(&gate.state, self.last_known_good().as_ref());
            self.cache.replace(provisional);
            self.launch(gate);
        } else {
            if gate.origin.take().is_some() {
                debug!(state = ?gate.state, "Fetch no longer applicable, cancelling");
            }
            let derived = self
                .policy
                .derive(&gate.state, self.last_known_good().as_ref());
            self.cache.replace(derived);
        }
    }

    fn launch(&self, gate: &mut GateState<S>) {
        let origin = gate.state.clone();
        gate.origin = Some(origin.clone());
        self.cache.fetch(origin.clone(), self.handlers_for(origin));
    }

    fn handlers_for(&self, origin: S) -> FetchHandlers<T> {
        let last_known_good = Arc::clone(&self.last_known_good);
        let remembers = self.policy.remembers(&origin);
        let policy = Arc::clone(&self.policy);
        let error_origin = origin.clone();

        FetchHandlers::new(
            move |value: Option<T>| {
                if let (true, Some(value)) = (remembers, value) {
                    *lock(&last_known_good) = Some(value);
                }
            },
            move |error| policy.on_error(&error_origin, error),
        )
    }

    pub fn state(&self) -> S {
        lock(&self.gate).state.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.gate).connected
    }

    pub fn last_known_good(&self) -> Option<T> {
        lock(&self.last_known_good).clone()
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
