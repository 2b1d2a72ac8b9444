//! The orchestration loop behind `RetryingFetchCache`.
//!
//! Callers never touch cache state directly. `fetch`, `cancel` and the
//! crate-internal `replace` advance the generation counter synchronously and
//! then queue a command for the cache's orchestration task, which is the only
//! place the value is mutated and the only place handlers and observers run.
//! Attempts and backoff timers report back through the same queue, tagged with
//! the generation they belong to; anything tagged with an older generation is
//! dropped on arrival.
//!
//! The generation advance in the caller and the check-then-publish sequence in
//! the orchestration task are serialized by a re-entrant dispatch monitor. Once
//! `fetch` or `cancel` has returned, no handler of an older request can run,
//! while handlers and observers may still call back into the cache from inside
//! a delivery on the same thread.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::attempt::{BackoffTimer, FetchAttempt, FetchOperation, Work};
use super::handlers::{FetchHandlers, RetryAction};
use crate::backoff::BackoffSchedule;
use crate::error::FetchError;
use crate::observable::{Observable, SubscriptionId};

/// Applicability predicate, checked before every attempt.
pub type Gate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Called with every successfully fetched value, after observers.
pub type UpdateCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) enum Command<K, T> {
    Fetch {
        generation: u64,
        key: K,
        handlers: FetchHandlers<T>,
    },
    Cancel {
        generation: u64,
    },
    Replace {
        generation: u64,
        value: Option<T>,
    },
    Completed {
        generation: u64,
        result: Result<T, FetchError>,
    },
    RetryDue {
        generation: u64,
    },
}

struct Shared<T> {
    generation: AtomicU64,
    value: Observable<T>,
    dispatch: ReentrantMutex<()>,
}

impl<T> Shared<T> {
    /// Held while advancing the generation and while publishing a result
    fn dispatch(&self) -> ReentrantMutexGuard<'_, ()> {
        self.dispatch.lock()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct CacheBuilder<K, T> {
    name: &'static str,
    operation: Arc<dyn FetchOperation<K, T>>,
    schedule: BackoffSchedule,
    gate: Option<Gate>,
    on_update: Option<UpdateCallback<T>>,
    initial: Option<T>,
    runtime: Option<Handle>,
}

impl<K, T> CacheBuilder<K, T>
where
    K: Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Only launch attempts while `gate` returns true. A request whose gate
    /// is closed is parked until it is superseded.
    pub fn gate<G>(mut self, gate: G) -> Self
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn on_update<U>(mut self, on_update: U) -> Self
    where
        U: Fn(&T) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(on_update));
        self
    }

    pub fn initial_value(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// Runtime that runs the orchestration task and therefore delivers every
    /// notification. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Spawn the orchestration task and return the cache handle.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was configured and this is called outside a Tokio
    /// runtime.
    pub fn build(self) -> RetryingFetchCache<K, T> {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            value: Observable::new(self.initial),
            dispatch: ReentrantMutex::new(()),
        });
        let lifetime = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator {
            name: self.name,
            operation: self.operation,
            schedule: self.schedule,
            gate: self.gate,
            on_update: self.on_update,
            shared: Arc::clone(&shared),
            reports: tx.clone(),
            runtime: runtime.clone(),
            lifetime: lifetime.clone(),
            active: None,
        };
        runtime.spawn(orchestrator.run(rx));

        debug!(cache = self.name, schedule = ?self.schedule, "Fetch cache started");

        RetryingFetchCache {
            name: self.name,
            shared,
            commands: tx,
            lifetime,
        }
    }
}

// ============================================================================
// Cache handle
// ============================================================================

/// Handle to a retrying fetch cache. Dropping it shuts the cache down.
pub struct RetryingFetchCache<K, T> {
    name: &'static str,
    shared: Arc<Shared<T>>,
    commands: UnboundedSender<Command<K, T>>,
    lifetime: CancellationToken,
}

impl<K, T> RetryingFetchCache<K, T>
where
    K: Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn builder<O>(name: &'static str, operation: O) -> CacheBuilder<K, T>
    where
        O: FetchOperation<K, T>,
    {
        CacheBuilder {
            name,
            operation: Arc::new(operation),
            schedule: BackoffSchedule::default(),
            gate: None,
            on_update: None,
            initial: None,
            runtime: None,
        }
    }

    /// Start a new attempt sequence for `key`, superseding any active one.
    pub fn fetch(&self, key: K, handlers: FetchHandlers<T>) {
        let _dispatch = self.shared.dispatch();
        let generation = self.shared.advance_generation();
        trace!(cache = self.name, generation, ?key, "Fetch requested");
        self.send(Command::Fetch {
            generation,
            key,
            handlers,
        });
    }

    /// Stop the active sequence. Its handlers are never called again.
    pub fn cancel(&self) {
        let _dispatch = self.shared.dispatch();
        let generation = self.shared.advance_generation();
        self.send(Command::Cancel { generation });
    }

    /// Supersede the active sequence and set the value without fetching.
    pub(crate) fn replace(&self, value: Option<T>) {
        let _dispatch = self.shared.dispatch();
        let generation = self.shared.advance_generation();
        self.send(Command::Replace { generation, value });
    }

    /// Current value, as last set by the orchestration task
    pub fn value(&self) -> Option<T> {
        self.shared.value.get()
    }

    pub fn generation(&self) -> u64 {
        self.shared.current_generation()
    }

    /// Attach an observer. It is called right away with the current value,
    /// then on every change until unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let _dispatch = self.shared.dispatch();
        self.shared.value.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.value.unsubscribe(id)
    }

    /// Cancel all pending work and stop delivering notifications.
    pub fn shutdown(&self) {
        if !self.lifetime.is_cancelled() {
            info!(cache = self.name, "Shutting down fetch cache");
            self.lifetime.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    fn send(&self, command: Command<K, T>) {
        if self.commands.send(command).is_err() {
            debug!(cache = self.name, "Fetch cache already shut down, ignoring command");
        }
    }
}

impl<K, T> Drop for RetryingFetchCache<K, T> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

// ============================================================================
// Orchestration task
// ============================================================================

struct ActiveRequest<K, T> {
    key: K,
    generation: u64,
    attempt: u32,
    handlers: FetchHandlers<T>,
    work: Option<Work>,
}

struct Orchestrator<K, T> {
    name: &'static str,
    operation: Arc<dyn FetchOperation<K, T>>,
    schedule: BackoffSchedule,
    gate: Option<Gate>,
    on_update: Option<UpdateCallback<T>>,
    shared: Arc<Shared<T>>,
    reports: UnboundedSender<Command<K, T>>,
    runtime: Handle,
    lifetime: CancellationToken,
    active: Option<ActiveRequest<K, T>>,
}

impl<K, T> Orchestrator<K, T>
where
    K: Clone + Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut commands: UnboundedReceiver<Command<K, T>>) {
        let lifetime = self.lifetime.clone();
        loop {
            tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        self.stop_active();
        self.shared.value.clear_listeners();
        debug!(cache = self.name, "Fetch cache stopped");
    }

    fn handle(&mut self, command: Command<K, T>) {
        match command {
            Command::Fetch {
                generation,
                key,
                handlers,
            } => self.start(generation, key, handlers),
            Command::Cancel { generation } => self.supersede(generation),
            Command::Replace { generation, value } => {
                let shared = Arc::clone(&self.shared);
                let _dispatch = shared.dispatch();
                self.supersede(generation);
                self.shared.value.set(value);
            }
            Command::Completed { generation, result } => {
                let shared = Arc::clone(&self.shared);
                let _dispatch = shared.dispatch();
                self.complete(generation, result);
            }
            Command::RetryDue { generation } => self.retry_due(generation),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.shared.current_generation()
            && self.active.as_ref().map(|a| a.generation) == Some(generation)
    }

    fn start(&mut self, generation: u64, key: K, handlers: FetchHandlers<T>) {
        if generation != self.shared.current_generation() {
            debug!(cache = self.name, generation, "Fetch superseded before it started");
            return;
        }

        self.stop_active();
        debug!(cache = self.name, generation, ?key, "Starting fetch sequence");
        self.active = Some(ActiveRequest {
            key,
            generation,
            attempt: 0,
            handlers,
            work: None,
        });
        self.launch_attempt();
    }

    /// Drop the active request if it predates `generation`
    fn supersede(&mut self, generation: u64) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.generation < generation)
        {
            self.stop_active();
        }
    }

    fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(
                cache = self.name,
                generation = active.generation,
                attempt = active.attempt,
                "Fetch sequence superseded"
            );
            if let Some(work) = active.work {
                work.cancel();
            }
        }
    }

    fn launch_attempt(&mut self) {
        let gate_open = self.gate.as_ref().map_or(true, |gate| gate());
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if !gate_open {
            debug!(
                cache = self.name,
                generation = active.generation,
                "Fetch not applicable right now, parking request"
            );
            active.work = None;
            return;
        }

        let attempt = FetchAttempt::launch(
            Arc::clone(&self.operation),
            active.key.clone(),
            active.generation,
            active.attempt,
            &self.lifetime,
            self.reports.clone(),
            &self.runtime,
        );
        active.work = Some(Work::Attempt(attempt));
    }

    fn complete(&mut self, generation: u64, result: Result<T, FetchError>) {
        if !self.is_current(generation) {
            debug!(cache = self.name, generation, "Discarding superseded fetch result");
            return;
        }

        match result {
            Ok(value) => self.succeed(value),
            Err(error) => self.fail(generation, error),
        }
    }

    fn succeed(&mut self, value: T) {
        let Some(active) = self.active.take() else {
            return;
        };
        debug!(
            cache = self.name,
            generation = active.generation,
            attempts = active.attempt + 1,
            "Fetch succeeded"
        );

        self.shared.value.set(Some(value.clone()));
        if let Some(on_update) = &self.on_update {
            on_update(&value);
        }
        active.handlers.finish(Some(value));
    }

    fn fail(&mut self, generation: u64, error: FetchError) {
        let action = match self.active.as_mut() {
            Some(active) => {
                active.work = None;
                (active.handlers.on_error)(&error)
            }
            None => return,
        };

        // The error handler may have started or cancelled a fetch itself
        if generation != self.shared.current_generation() {
            debug!(cache = self.name, generation, "Fetch superseded by its error handler");
            return;
        }

        match action {
            RetryAction::Stop => {
                debug!(cache = self.name, generation, error = %error, "Fetch stopped by caller");
                if let Some(active) = self.active.take() {
                    active.handlers.finish(None);
                }
            }
            RetryAction::Retry => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.attempt = active.attempt.saturating_add(1);
                let delay = self.schedule.delay(active.attempt);
                warn!(
                    cache = self.name,
                    generation,
                    attempt = active.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Fetch failed, backing off"
                );
                let timer = BackoffTimer::start(
                    delay,
                    generation,
                    &self.lifetime,
                    self.reports.clone(),
                    &self.runtime,
                );
                active.work = Some(Work::Backoff(timer));
            }
        }
    }

    fn retry_due(&mut self, generation: u64) {
        if !self.is_current(generation) {
            trace!(cache = self.name, generation, "Ignoring stale backoff timer");
            return;
        }
        self.launch_attempt();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;

    type Cache = RetryingFetchCache<&'static str, u32>;

    /// Forward every observer notification into a channel
    fn observe(cache: &Cache) -> mpsc::UnboundedReceiver<Option<u32>> {
        let (tx, rx) = mpsc::unbounded_channel();
        cache.subscribe(move |value| {
            let _ = tx.send(value.copied());
        });
        rx
    }

    fn finish_channel() -> (
        FetchHandlers<u32>,
        mpsc::UnboundedReceiver<Option<u32>>,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let handlers = FetchHandlers::new(
            move |value| {
                let _ = tx.send(value);
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                RetryAction::Retry
            },
        );
        (handlers, rx, errors)
    }

    /// Let the orchestration task drain its queue
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_notifies_once() {
        let cache: Cache =
            RetryingFetchCache::builder("test", |_key: &'static str| async { Ok(7) }).build();
        let mut updates = observe(&cache);
        assert_eq!(updates.recv().await, Some(None));

        let (handlers, mut finished, errors) = finish_channel();
        cache.fetch("a", handlers);

        assert_eq!(finished.recv().await, Some(Some(7)));
        assert_eq!(updates.recv().await, Some(Some(7)));
        assert_eq!(cache.value(), Some(7));
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        settle().await;
        assert!(updates.try_recv().is_err());
        assert!(finished.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_backoff_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let schedule = BackoffSchedule::LOCATION;
        let cache: Cache = RetryingFetchCache::builder("test", move |_key: &'static str| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(FetchError::rpc("first attempt fails"))
                } else {
                    Ok(42)
                }
            }
        })
        .schedule(schedule)
        .build();
        let mut updates = observe(&cache);
        assert_eq!(updates.recv().await, Some(None));

        let start = Instant::now();
        let (handlers, mut finished, errors) = finish_channel();
        cache.fetch("a", handlers);

        assert_eq!(finished.recv().await, Some(Some(42)));
        assert!(start.elapsed() >= schedule.delay(1));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(updates.recv().await, Some(Some(42)));

        settle().await;
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_finishes_without_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: Cache = RetryingFetchCache::builder("test", move |_key: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::DaemonUnavailable) }
        })
        .initial_value(1)
        .build();

        let (tx, mut finished) = mpsc::unbounded_channel();
        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = Arc::clone(&errors);
        cache.fetch(
            "a",
            FetchHandlers::new(
                move |value| {
                    let _ = tx.send(value);
                },
                move |error| {
                    assert_eq!(*error, FetchError::DaemonUnavailable);
                    error_count.fetch_add(1, Ordering::SeqCst);
                    RetryAction::Stop
                },
            ),
        );

        assert_eq!(finished.recv().await, Some(None));
        // Well past any backoff delay: nothing else may run
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(cache.value(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fetch_is_silent() {
        let (first_tx, first_rx) = oneshot::channel::<u32>();
        let first_rx = Arc::new(Mutex::new(Some(first_rx)));
        let cache: Cache = RetryingFetchCache::builder("test", move |key: &'static str| {
            let pending = first_rx.lock().unwrap().take();
            async move {
                match (key, pending) {
                    ("a", Some(rx)) => rx.await.map_err(|_| FetchError::DaemonUnavailable),
                    _ => Ok(2),
                }
            }
        })
        .build();
        let mut updates = observe(&cache);
        assert_eq!(updates.recv().await, Some(None));

        let first_calls = Arc::new(AtomicUsize::new(0));
        let finish_calls = Arc::clone(&first_calls);
        let error_calls = Arc::clone(&first_calls);
        cache.fetch(
            "a",
            FetchHandlers::new(
                move |_| {
                    finish_calls.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    error_calls.fetch_add(1, Ordering::SeqCst);
                    RetryAction::Stop
                },
            ),
        );
        settle().await;

        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("b", handlers);
        assert_eq!(finished.recv().await, Some(Some(2)));

        // The first request resolves late and must change nothing
        let _ = first_tx.send(1);
        settle().await;

        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.value(), Some(2));
        assert_eq!(updates.recv().await, Some(Some(2)));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_from_inside_operation_cancels_first() {
        // Mirrors a caller that re-issues a fetch while the first is in flight
        let handle: Arc<OnceLock<Arc<Cache>>> = Arc::new(OnceLock::new());
        let inner = Arc::clone(&handle);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (second_tx, mut second_finished) = mpsc::unbounded_channel();

        let cache = Arc::new(
            RetryingFetchCache::builder("test", move |key: &'static str| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    if let Some(cache) = inner.get() {
                        let tx = second_tx.clone();
                        cache.fetch(
                            "second",
                            FetchHandlers::new(
                                move |value| {
                                    let _ = tx.send(value);
                                },
                                |_| RetryAction::Stop,
                            ),
                        );
                    }
                }
                async move {
                    if key == "first" {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(9)
                }
            })
            .build(),
        );
        let _ = handle.set(Arc::clone(&cache));

        let first_called = Arc::new(AtomicUsize::new(0));
        let on_finish = Arc::clone(&first_called);
        let on_error = Arc::clone(&first_called);
        cache.fetch(
            "first",
            FetchHandlers::new(
                move |_| {
                    on_finish.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    on_error.fetch_add(1, Ordering::SeqCst);
                    RetryAction::Stop
                },
            ),
        );

        assert_eq!(second_finished.recv().await, Some(Some(9)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first_called.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: Cache = RetryingFetchCache::builder("test", move |_key: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Offline) }
        })
        .build();

        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("a", handlers);
        settle().await;
        cache.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(finished.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_gate_parks_request() {
        let open = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gate = Arc::clone(&open);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: Cache = RetryingFetchCache::builder("test", move |_key: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(5) }
        })
        .gate(move || gate.load(Ordering::SeqCst))
        .build();

        cache.fetch("a", FetchHandlers::default());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.value(), None);

        open.store(true, Ordering::SeqCst);
        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("a", handlers);
        assert_eq!(finished.recv().await, Some(Some(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_gets_current_value() {
        let cache: Cache =
            RetryingFetchCache::builder("test", |_key: &'static str| async { Ok(3) }).build();
        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("a", handlers);
        assert_eq!(finished.recv().await, Some(Some(3)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.subscribe(move |value| sink.lock().unwrap().push(value.copied()));
        // Delivered before subscribe returned
        assert_eq!(*seen.lock().unwrap(), vec![Some(3)]);

        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_update_only_on_success() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let cache: Cache =
            RetryingFetchCache::builder("test", |key: &'static str| async move {
                if key == "bad" {
                    Err(FetchError::Offline)
                } else {
                    Ok(11)
                }
            })
            .on_update(move |value| sink.lock().unwrap().push(*value))
            .build();

        let (tx, mut finished) = mpsc::unbounded_channel();
        cache.fetch(
            "bad",
            FetchHandlers::new(
                move |value| {
                    let _ = tx.send(value);
                },
                |_| RetryAction::Stop,
            ),
        );
        assert_eq!(finished.recv().await, Some(None));
        assert!(updates.lock().unwrap().is_empty());

        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("good", handlers);
        assert_eq!(finished.recv().await, Some(Some(11)));
        assert_eq!(*updates.lock().unwrap(), vec![11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_silences_everything() {
        let cache: Cache = RetryingFetchCache::builder("test", |_key: &'static str| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(1)
        })
        .build();
        let mut updates = observe(&cache);
        assert_eq!(updates.recv().await, Some(None));

        let (handlers, mut finished, _) = finish_channel();
        cache.fetch("a", handlers);
        settle().await;
        cache.shutdown();
        assert!(cache.is_shut_down());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(finished.try_recv().is_err());
        assert_eq!(cache.value(), None);
        // Listener was dropped with the task, closing the channel
        assert_eq!(updates.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_advances_per_request() {
        let cache: Cache =
            RetryingFetchCache::builder("test", |_key: &'static str| async { Ok(1) }).build();
        assert_eq!(cache.generation(), 0);
        cache.fetch("a", FetchHandlers::default());
        cache.fetch("a", FetchHandlers::default());
        cache.cancel();
        assert_eq!(cache.generation(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_older_handlers_never_fire_after_fetch_returns() {
        let cache: RetryingFetchCache<u32, u32> =
            RetryingFetchCache::builder("test", |key: u32| async move { Ok(key) }).build();

        // Hold up the delivery of the first result inside an observer
        let (publishing_tx, publishing_rx) = std_mpsc::channel();
        let publishing_tx = Mutex::new(publishing_tx);
        cache.subscribe(move |value| {
            if value == Some(&1) {
                let _ = publishing_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let returned = Arc::new(AtomicBool::new(false));
        let finished_late = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let handlers = {
            let returned = Arc::clone(&returned);
            let finished_late = Arc::clone(&finished_late);
            let finished = Arc::clone(&finished);
            FetchHandlers::retry_forever().on_finish(move |_| {
                finished_late.store(returned.load(Ordering::SeqCst), Ordering::SeqCst);
                finished.store(true, Ordering::SeqCst);
            })
        };
        cache.fetch(1, handlers);

        tokio::task::spawn_blocking(move || publishing_rx.recv())
            .await
            .unwrap()
            .unwrap();
        cache.fetch(2, FetchHandlers::retry_forever());
        returned.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!finished_late.load(Ordering::SeqCst));
        assert_eq!(cache.generation(), 2);
        assert_eq!(cache.value(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_blocks_until_running_delivery_is_done() {
        let cache: RetryingFetchCache<u32, u32> =
            RetryingFetchCache::builder("test", |key: u32| async move { Ok(key) }).build();

        let (publishing_tx, publishing_rx) = std_mpsc::channel();
        let publishing_tx = Mutex::new(publishing_tx);
        cache.subscribe(move |value| {
            if value.is_some() {
                let _ = publishing_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let (finish_tx, finish_rx) = std_mpsc::channel();
        cache.fetch(
            7,
            FetchHandlers::retry_forever().on_finish(move |value| {
                let _ = finish_tx.send(value);
            }),
        );

        tokio::task::spawn_blocking(move || publishing_rx.recv())
            .await
            .unwrap()
            .unwrap();
        cache.cancel();

        // The delivery that was already running completed before cancel returned
        assert_eq!(finish_rx.try_recv(), Ok(Some(7)));
        assert_eq!(cache.value(), Some(7));
    }

    #[test]
    fn test_notifications_run_on_configured_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cache-delivery")
            .enable_time()
            .build()
            .unwrap();
        let cache: RetryingFetchCache<u32, u32> =
            RetryingFetchCache::builder("test", |key: u32| async move { Ok(key * 2) })
                .runtime(runtime.handle().clone())
                .build();

        let thread_name = || std::thread::current().name().map(str::to_string);
        let (tx, rx) = std_mpsc::channel();
        let observer_tx = Mutex::new(tx.clone());
        cache.subscribe(move |value| {
            let _ = observer_tx
                .lock()
                .unwrap()
                .send(("observer", value.copied(), thread_name()));
        });

        // Replay happens on the subscribing thread
        let (_, replayed, replay_thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(replayed, None);
        assert_ne!(replay_thread.as_deref(), Some("cache-delivery"));

        cache.fetch(
            21,
            FetchHandlers::retry_forever().on_finish(move |value| {
                let _ = tx.send(("finish", value, thread_name()));
            }),
        );

        for expected in ["observer", "finish"] {
            let (source, value, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(source, expected);
            assert_eq!(value, Some(42));
            assert_eq!(thread.as_deref(), Some("cache-delivery"));
        }
    }
}
