//! Background work owned by a cache: fetch attempts and backoff timers.
//!
//! Both report back to the orchestration task through its command channel,
//! tagged with the generation they were launched for. Cancelling only stops
//! them cooperatively; the generation check on the receiving side is what
//! keeps stale reports from having any effect.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::retrying::Command;
use crate::error::FetchError;

/// The caller-supplied operation that resolves a value for a key.
///
/// Implemented for any `Fn(K) -> impl Future<Output = Result<T, FetchError>>`,
/// so plain async closures can be handed to a cache directly.
pub trait FetchOperation<K, T>: Send + Sync + 'static {
    fn fetch(&self, key: K) -> BoxFuture<'static, Result<T, FetchError>>;
}

impl<K, T, F, Fut> FetchOperation<K, T> for F
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    fn fetch(&self, key: K) -> BoxFuture<'static, Result<T, FetchError>> {
        Box::pin(self(key))
    }
}

/// One in-flight invocation of the fetch operation.
pub(crate) struct FetchAttempt {
    token: CancellationToken,
}

impl FetchAttempt {
    pub(crate) fn launch<K, T>(
        operation: Arc<dyn FetchOperation<K, T>>,
        key: K,
        generation: u64,
        number: u32,
        parent: &CancellationToken,
        reports: UnboundedSender<Command<K, T>>,
        runtime: &Handle,
    ) -> Self
    where
        K: Send + 'static,
        T: Send + 'static,
    {
        let token = parent.child_token();
        let cancelled = token.clone();

        runtime.spawn(async move {
            trace!(generation, attempt = number, "Fetch attempt started");
            let fetch = operation.fetch(key);

            tokio::select! {
                _ = cancelled.cancelled() => {
                    trace!(generation, attempt = number, "Fetch attempt cancelled");
                }
                result = fetch => {
                    if reports.send(Command::Completed { generation, result }).is_err() {
                        trace!(generation, "Cache gone before attempt completed");
                    }
                }
            }
        });

        Self { token }
    }
}

/// Wait between a failed attempt and the next one.
pub(crate) struct BackoffTimer {
    token: CancellationToken,
}

impl BackoffTimer {
    pub(crate) fn start<K, T>(
        delay: Duration,
        generation: u64,
        parent: &CancellationToken,
        reports: UnboundedSender<Command<K, T>>,
        runtime: &Handle,
    ) -> Self
    where
        K: Send + 'static,
        T: Send + 'static,
    {
        let token = parent.child_token();
        let cancelled = token.clone();

        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = reports.send(Command::RetryDue { generation });
                }
            }
        });

        Self { token }
    }
}

/// Whatever the active request is currently waiting on.
pub(crate) enum Work {
    Attempt(FetchAttempt),
    Backoff(BackoffTimer),
}

impl Work {
    pub(crate) fn cancel(self) {
        match self {
            Work::Attempt(attempt) => attempt.token.cancel(),
            Work::Backoff(timer) => timer.token.cancel(),
        }
    }
}
