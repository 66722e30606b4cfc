//! Observer registration and fan-out.
//!
//! The registry keeps observers in registration order behind a copy-on-write
//! snapshot. `register` swaps in a new list under the write lock; `dispatch`
//! holds the read lock only long enough to clone the current list, so no lock
//! is held while observer code runs and a callback may register further
//! observers without deadlocking.
//!
//! There is no unregister: observers live as long as the registry.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::warn;

/// Receives dispatched responses.
pub trait Observer<R>: Send + Sync {
    /// Called with every response for which [`Observer::matches`] is true.
    fn notify(&self, response: &R) -> Result<(), ObserverError>;

    fn matches(&self, _response: &R) -> bool {
        true
    }
}

/// Failure raised by an observer during dispatch.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ObserverError {
    /// The observer reported an error.
    #[error("observer failed: {0}")]
    Failed(String),
    /// The observer or its predicate panicked.
    #[error("observer panicked: {0}")]
    Panicked(String),
}

impl ObserverError {
    /// Wraps any displayable error as [`ObserverError::Failed`].
    pub fn failed(reason: impl fmt::Display) -> Self {
        ObserverError::Failed(reason.to_string())
    }
}

/// Predicate accepting every response.
pub fn always<R>(_response: &R) -> bool {
    true
}

/// Adapts a callback and predicate pair into an [`Observer`].
pub struct FnObserver<F, Q> {
    callback: F,
    predicate: Q,
}

impl<F, Q> FnObserver<F, Q> {
    pub fn new(callback: F, predicate: Q) -> Self {
        Self {
            callback,
            predicate,
        }
    }
}

impl<R, F, Q> Observer<R> for FnObserver<F, Q>
where
    F: Fn(&R) + Send + Sync,
    Q: Fn(&R) -> bool + Send + Sync,
{
    fn notify(&self, response: &R) -> Result<(), ObserverError> {
        (self.callback)(response);
        Ok(())
    }

    fn matches(&self, response: &R) -> bool {
        (self.predicate)(response)
    }
}

/// Identifies a registered observer in logs and reports.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Raw id, unique within one registry.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

struct Entry<R> {
    id: ObserverId,
    observer: Arc<dyn Observer<R>>,
}

impl<R> Clone for Entry<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            observer: Arc::clone(&self.observer),
        }
    }
}

/// Summary of one [`ObserverRegistry::dispatch`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Observers whose predicate matched and whose callback returned normally.
    pub notified: usize,
    /// Observers that failed or panicked, in dispatch order.
    pub failures: Vec<(ObserverId, ObserverError)>,
}

/// Thread-safe, ordered set of observers.
pub struct ObserverRegistry<R> {
    entries: RwLock<Arc<Vec<Entry<R>>>>,
    next_id: AtomicU64,
}

impl<R> ObserverRegistry<R> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends an observer; visible to every dispatch that starts afterwards.
    pub fn register<O>(&self, observer: O) -> ObserverId
    where
        O: Observer<R> + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            observer: Arc::new(observer),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(entry);
        *entries = Arc::new(next);
        id
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Invokes every matching observer, in registration order, with `response`.
    ///
    /// A failing or panicking observer is reported and skipped; the rest of
    /// the dispatch proceeds.
    pub fn dispatch(&self, response: &R) -> DispatchReport {
        let snapshot = self.snapshot();
        let mut report = DispatchReport::default();

        for entry in snapshot.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if !entry.observer.matches(response) {
                    return Ok(false);
                }
                entry.observer.notify(response).map(|()| true)
            }));

            let error = match outcome {
                Ok(Ok(true)) => {
                    report.notified += 1;
                    continue;
                }
                Ok(Ok(false)) => continue,
                Ok(Err(err)) => err,
                Err(payload) => ObserverError::Panicked(panic_message(payload.as_ref())),
            };

            warn!(event = "observer_failed", observer = %entry.id, error = %error);
            report.failures.push((entry.id, error));
        }

        report
    }

    fn snapshot(&self) -> Arc<Vec<Entry<R>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&entries)
    }
}

impl<R> Default for ObserverRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for ObserverRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
