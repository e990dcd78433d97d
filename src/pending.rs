//! Deferred values: the "not available yet" half of property access.
//!
//! Reading a required property that has no value yet does not fail. It yields
//! [`Access::Pending`] carrying a [`Pending`] marker, which settles when the
//! property is first written (resolved) or the entity is destroyed first
//! (rejected). Effects that hit a pending marker suspend and re-run once it
//! settles; collaborators can `.await` it or attach a settle callback.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::{Key, Value};

type SettleCallback = Box<dyn FnOnce(&Result<Value>) + Send>;

struct Shared {
    outcome: Option<Result<Value>>,
    wakers: Vec<Waker>,
    callbacks: Vec<SettleCallback>,
}

/// Awaitable placeholder for a value that has not been written yet.
///
/// Clones share the same state; every clone settles together.
#[derive(Clone)]
pub struct Pending {
    key: Key,
    shared: Arc<Mutex<Shared>>,
}

impl Pending {
    pub(crate) fn new(key: Key) -> Self {
        Self {
            key,
            shared: Arc::new(Mutex::new(Shared {
                outcome: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            })),
        }
    }

    /// The property this marker waits for.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn is_settled(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// The outcome, if already settled.
    pub fn outcome(&self) -> Option<Result<Value>> {
        self.shared.lock().outcome.clone()
    }

    /// Whether two markers are the same placeholder.
    pub fn ptr_eq(&self, other: &Pending) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `f` once this marker settles; immediately if it already has.
    pub fn on_settle<F>(&self, f: F)
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
    {
        let settled = {
            let mut shared = self.shared.lock();
            match &shared.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    shared.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        if let Some(outcome) = settled {
            f(&outcome);
        }
    }

    pub(crate) fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    pub(crate) fn reject(&self, error: Error) {
        self.settle(Err(error));
    }

    fn settle(&self, outcome: Result<Value>) {
        let (wakers, callbacks) = {
            let mut shared = self.shared.lock();
            if shared.outcome.is_some() {
                return;
            }
            shared.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut shared.wakers),
                std::mem::take(&mut shared.callbacks),
            )
        };
        // Lock released before anyone is woken or called.
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&outcome);
        }
    }
}

impl Future for Pending {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock();
        if let Some(outcome) = &shared.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            shared.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("key", &self.key)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Outcome of reading a property.
#[derive(Debug)]
pub enum Access<T = Value> {
    Ready(T),
    /// Value not written yet; the marker settles when it is.
    Pending(Pending),
    Failed(Error),
}

impl<T> Access<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Access::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Access::Pending(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Access::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn pending(self) -> Option<Pending> {
        match self {
            Access::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> Access<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Access::Ready(value) => Access::Ready(f(value)),
            Access::Pending(pending) => Access::Pending(pending),
            Access::Failed(error) => Access::Failed(error),
        }
    }

    /// Collapse into a `Result`, treating a pending marker as `None`.
    pub fn into_result(self) -> Result<Option<T>> {
        match self {
            Access::Ready(value) => Ok(Some(value)),
            Access::Pending(_) => Ok(None),
            Access::Failed(error) => Err(error),
        }
    }
}

impl<T> From<Result<T>> for Access<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Access::Ready(value),
            Err(error) => Access::Failed(error),
        }
    }
}

impl<T> From<Error> for Access<T> {
    fn from(error: Error) -> Self {
        Access::Failed(error)
    }
}

/// Unwrap an [`Access`], returning early from the enclosing function with the
/// pending marker or error otherwise.
///
/// The enclosing function must return an `Access<_>`, as effect bodies and
/// instruction getters do.
///
/// ```ignore
/// entity.effect(|current| {
///     let name = ready!(current.get("name"));
///     println!("hello {name}");
///     Access::Ready(None)
/// });
/// ```
#[macro_export]
macro_rules! ready {
    ($access:expr) => {
        match $access {
            $crate::Access::Ready(value) => value,
            $crate::Access::Pending(pending) => return $crate::Access::Pending(pending),
            $crate::Access::Failed(error) => return $crate::Access::Failed(error),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resolves_every_clone() {
        let pending = Pending::new("value".into());
        let clone = pending.clone();
        assert!(clone.clone().now_or_never().is_none());

        pending.resolve(Value::from("x"));

        assert_eq!(clone.now_or_never(), Some(Ok(Value::from("x"))));
        assert!(pending.is_settled());
    }

    #[test]
    fn settles_only_once() {
        let pending = Pending::new("value".into());
        pending.reject(Error::Stale);
        pending.resolve(Value::from(1));

        assert_eq!(pending.outcome(), Some(Err(Error::Stale)));
    }

    #[test]
    fn settle_callbacks_run_once_and_late_callbacks_run_immediately() {
        let pending = Pending::new("value".into());
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        pending.on_settle(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        pending.resolve(Value::Null);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let c = calls.clone();
        pending.on_settle(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn ready_macro_short_circuits() {
        fn double(input: Access<f64>) -> Access<f64> {
            let n = ready!(input);
            Access::Ready(n * 2.0)
        }

        assert_eq!(double(Access::Ready(2.0)).ready(), Some(4.0));
        assert!(double(Access::Pending(Pending::new("n".into()))).is_pending());
        assert!(matches!(
            double(Access::Failed(Error::Stale)),
            Access::Failed(Error::Stale)
        ));
    }
}
