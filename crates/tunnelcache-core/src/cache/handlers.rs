use crate::error::FetchError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait for the next backoff delay and try again
    Retry,
    /// Give up; the sequence finishes without a value
    Stop,
}

type FinishFn<T> = Box<dyn FnOnce(Option<T>) + Send>;
type ErrorFn = Box<dyn FnMut(&FetchError) -> RetryAction + Send>;

/// Per-call callbacks for one `fetch` sequence.
///
/// `on_error` runs once per failed attempt. `on_finish` runs exactly once when
/// the sequence ends: with the value on success, or with `None` after
/// `on_error` returned [`RetryAction::Stop`]. Neither runs once the sequence
/// has been superseded.
pub struct FetchHandlers<T> {
    pub(crate) on_finish: FinishFn<T>,
    pub(crate) on_error: ErrorFn,
}

impl<T> FetchHandlers<T> {
    pub fn new<F, E>(on_finish: F, on_error: E) -> Self
    where
        F: FnOnce(Option<T>) + Send + 'static,
        E: FnMut(&FetchError) -> RetryAction + Send + 'static,
    {
        Self {
            on_finish: Box::new(on_finish),
            on_error: Box::new(on_error),
        }
    }

    /// Retry every failure and ignore the outcome
    pub fn retry_forever() -> Self {
        Self::new(|_| {}, |_| RetryAction::Retry)
    }

    /// Replace the finish callback, keeping the error policy
    pub fn on_finish<F>(mut self, on_finish: F) -> Self
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        self.on_finish = Box::new(on_finish);
        self
    }

    /// Replace the error policy, keeping the finish callback
    pub fn on_error<E>(mut self, on_error: E) -> Self
    where
        E: FnMut(&FetchError) -> RetryAction + Send + 'static,
    {
        self.on_error = Box::new(on_error);
        self
    }

    pub(crate) fn finish(self, value: Option<T>) {
        (self.on_finish)(value)
    }
}

impl<T> Default for FetchHandlers<T> {
    fn default() -> Self {
        Self::retry_forever()
    }
}

impl<T> std::fmt::Debug for FetchHandlers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandlers").finish_non_exhaustive()
    }
}
