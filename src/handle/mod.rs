//! Completable handles for in-flight requests and the operations built on them.
//!
//! Nothing here blocks: progress is driven by completion listeners. [RequestHandle::wait]
//! is offered for callers that want to block at the edge.

mod fork_join;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Error, Result};

pub(crate) use fork_join::{first_completed, fork_join, ForkJoinOutcome};

type Listener<T> = Box<dyn FnOnce(&RequestHandle<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// A single request (or a whole operation) that completes exactly once, with either
/// a value or an [Error].
///
/// Cloning a handle yields another reference to the same request.
pub struct RequestHandle<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    outcome: Option<Result<T>>,
    listeners: Vec<Listener<T>>,
    cancel_hook: Option<CancelHook>,
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for RequestHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> RequestHandle<T> {
    /// A pending handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                outcome: None,
                listeners: Vec::new(),
                cancel_hook: None,
            })),
        }
    }

    /// A handle that is already complete.
    pub fn completed(result: Result<T>) -> Self {
        let handle = Self::new();
        handle.complete(result);

        handle
    }

    // === Getters ===

    pub fn is_done(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Ok(_)))
    }

    /// True for failed and cancelled requests.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Err(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Err(Error::Cancelled)))
    }

    /// The error if this handle failed.
    pub fn error(&self) -> Option<Error> {
        match &self.inner.lock().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// A clone of the outcome, `None` while pending.
    pub fn result(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.inner.lock().outcome.clone()
    }

    /// Borrow the successful value, if any, without cloning it.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &self.inner.lock().outcome {
            Some(Ok(value)) => Some(f(value)),
            _ => None,
        }
    }

    // === Public Methods ===

    /// Complete this handle. Returns `false` if it was already complete, in which case
    /// `result` is dropped.
    pub fn complete(&self, result: Result<T>) -> bool {
        let listeners = {
            let mut state = self.inner.lock();

            if state.outcome.is_some() {
                return false;
            }

            state.outcome = Some(result);
            state.cancel_hook = None;

            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            listener(self);
        }

        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Cancel this handle if it is still pending, running its cancel hook first.
    ///
    /// Returns `false` if the handle had already completed.
    pub fn cancel(&self) -> bool {
        let hook = {
            let mut state = self.inner.lock();

            if state.outcome.is_some() {
                return false;
            }

            state.cancel_hook.take()
        };

        if let Some(hook) = hook {
            hook();
        }

        self.complete(Err(Error::Cancelled))
    }

    /// Run `listener` once this handle completes, or right away if it already has.
    ///
    /// Listeners run on whichever thread completes the handle, never under its lock.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&RequestHandle<T>) + Send + 'static,
    {
        {
            let mut state = self.inner.lock();

            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return;
            }
        }

        listener(self)
    }

    /// Install the hook [Self::cancel] runs before completing this handle, replacing
    /// any previous hook. Ignored if already complete.
    pub(crate) fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();

        if state.outcome.is_none() {
            state.cancel_hook = Some(Box::new(hook));
        }
    }

    /// Block the current thread until this handle completes.
    pub fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        let (sender, receiver) = flume::bounded::<Result<T>>(1);

        self.add_listener(move |handle| {
            if let Some(result) = handle.result() {
                let _ = sender.send(result);
            }
        });

        receiver
            .recv()
            .unwrap_or_else(|_| Err(Error::Cancelled))
    }

    /// Await this handle without blocking a thread.
    #[cfg(feature = "async")]
    pub async fn wait_async(&self) -> Result<T>
    where
        T: Clone,
    {
        let (sender, receiver) = flume::bounded::<Result<T>>(1);

        self.add_listener(move |handle| {
            if let Some(result) = handle.result() {
                let _ = sender.send(result);
            }
        });

        receiver
            .recv_async()
            .await
            .unwrap_or_else(|_| Err(Error::Cancelled))
    }

    /// Map a successful value into a new handle, failures pass through.
    pub fn map<U, F>(&self, f: F) -> RequestHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let mapped = RequestHandle::new();
        let source = self.clone();

        mapped.on_cancel(move || {
            source.cancel();
        });

        let target = mapped.clone();

        self.add_listener(move |handle| {
            let result = match handle.with_value(f) {
                Some(value) => Ok(value),
                None => Err(handle.error().unwrap_or(Error::Cancelled)),
            };
            target.complete(result);
        });

        mapped
    }
}

impl<T> Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.lock().outcome {
            None => "pending",
            Some(Ok(_)) => "success",
            Some(Err(Error::Cancelled)) => "cancelled",
            Some(Err(_)) => "failed",
        };

        f.debug_struct("RequestHandle").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn completes_once() {
        let handle = RequestHandle::new();

        assert!(handle.succeed(1));
        assert!(!handle.succeed(2));
        assert!(!handle.cancel());

        assert_eq!(handle.result(), Some(Ok(1)));
        assert!(handle.is_success());
        assert!(!handle.is_failed());
    }

    #[test]
    fn listeners_run_once_and_late_listeners_run_immediately() {
        let handle = RequestHandle::<u8>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        handle.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.fail(Error::Request("timeout".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        handle.add_listener(move |h| {
            assert!(h.is_failed());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_runs_hook_then_completes() {
        let handle = RequestHandle::<u8>::new();
        let hooked = Arc::new(AtomicUsize::new(0));

        let counter = hooked.clone();
        handle.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(handle.is_failed());
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert_eq!(handle.error(), Some(Error::Cancelled));
    }

    #[test]
    fn wait_blocks_until_completed_on_another_thread() {
        let handle = RequestHandle::new();

        let clone = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clone.succeed("done");
        });

        assert_eq!(handle.wait(), Ok("done"));
    }

    #[test]
    fn map_propagates_failures_and_cancellation() {
        let source = RequestHandle::<u32>::new();
        let mapped = source.map(|value| value * 2);

        source.succeed(21);
        assert_eq!(mapped.result(), Some(Ok(42)));

        let source = RequestHandle::<u32>::new();
        let mapped = source.map(|value| value * 2);

        mapped.cancel();
        assert!(source.is_cancelled());
        assert!(mapped.is_cancelled());
    }

    #[cfg(feature = "async")]
    #[test]
    fn wait_async() {
        let handle = RequestHandle::completed(Ok(7_u8));

        assert_eq!(futures::executor::block_on(handle.wait_async()), Ok(7));
    }
}
