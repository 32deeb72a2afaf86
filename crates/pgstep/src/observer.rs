//! Error Observer - Per-database notification of fatal store errors
//!
//! The handler is called once when a fatal error is first seen and again
//! with `None` once an operation succeeds. Empty result sets never count as
//! failures.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MigrateError, MigrateResult, StoreError};

/// Callback invoked with the current error state
pub type ErrorHandler = Arc<dyn Fn(Option<&StoreError>) + Send + Sync>;

#[derive(Default)]
struct ObserverState {
    handler: Option<ErrorHandler>,
    last: Mutex<Option<StoreError>>,
}

/// Tracks the last fatal error of one database instance
#[derive(Clone, Default)]
pub struct ErrorObserver {
    state: Arc<ObserverState>,
}

impl ErrorObserver {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Option<&StoreError>) + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ObserverState {
                handler: Some(Arc::new(handler)),
                last: Mutex::new(None),
            }),
        }
    }

    /// An observer without a handler; it still tracks the last error
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn last_error(&self) -> Option<StoreError> {
        self.last().clone()
    }

    /// Record the outcome of a store operation and convert it
    pub fn track<T>(&self, result: Result<T, StoreError>) -> MigrateResult<T> {
        match result {
            Ok(value) => {
                self.clear();
                Ok(value)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.record(&err);
                } else {
                    self.clear();
                }
                Err(MigrateError::Store(err))
            }
        }
    }

    /// Forget the last error, notifying the handler if one was set
    pub fn clear(&self) {
        let had_error = self.last().take().is_some();
        if had_error {
            self.notify(None);
        }
    }

    fn record(&self, err: &StoreError) {
        let first = {
            let mut last = self.last();
            let first = last.is_none();
            if first {
                *last = Some(err.clone());
            }
            first
        };
        if first {
            self.notify(Some(err));
        }
    }

    fn last(&self) -> MutexGuard<'_, Option<StoreError>> {
        self.state.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The state lock is never held while the handler runs
    fn notify(&self, err: Option<&StoreError>) {
        if let Some(handler) = &self.state.handler {
            handler(err);
        }
    }
}

impl fmt::Debug for ErrorObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorObserver")
            .field("has_handler", &self.state.handler.is_some())
            .field("last", &self.last_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;

    fn recording() -> (ErrorObserver, Arc<Mutex<Vec<Option<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = ErrorObserver::new(move |err| {
            sink.lock().unwrap().push(err.map(|e| e.message.clone()));
        });
        (observer, seen)
    }

    #[test]
    fn test_first_fatal_error_is_reported_once() {
        let (observer, seen) = recording();

        let _ = observer.track::<()>(Err(StoreError::new(StoreErrorKind::Connection, "down")));
        let _ = observer.track::<()>(Err(StoreError::new(StoreErrorKind::Connection, "still down")));

        assert_eq!(*seen.lock().unwrap(), vec![Some("down".to_string())]);
        assert_eq!(observer.last_error().map(|e| e.message), Some("down".to_string()));
    }

    #[test]
    fn test_recovery_is_reported() {
        let (observer, seen) = recording();

        assert!(observer.track(Ok::<_, StoreError>(1)).is_ok());
        let _ = observer.track::<()>(Err(StoreError::with_code("23505", "duplicate")));
        assert!(observer.track(Ok::<_, StoreError>(2)).is_ok());

        assert_eq!(*seen.lock().unwrap(), vec![Some("duplicate".to_string()), None]);
        assert!(observer.last_error().is_none());
    }

    #[test]
    fn test_no_rows_is_not_fatal() {
        let (observer, seen) = recording();

        let result = observer.track::<()>(Err(StoreError::new(StoreErrorKind::NoRows, "no rows")));

        assert!(matches!(result, Err(MigrateError::Store(ref e)) if e.is_no_rows()));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_observers_are_independent() {
        let (first, first_seen) = recording();
        let (second, second_seen) = recording();

        let _ = first.track::<()>(Err(StoreError::new(StoreErrorKind::Generic, "boom")));

        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert!(second_seen.lock().unwrap().is_empty());
        assert!(second.last_error().is_none());
    }

    #[test]
    fn test_handler_can_read_the_observer() {
        let slot: Arc<std::sync::OnceLock<ErrorObserver>> = Arc::new(std::sync::OnceLock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handler_slot, sink) = (slot.clone(), seen.clone());
        let observer = ErrorObserver::new(move |_| {
            let last = handler_slot.get().and_then(|o| o.last_error()).map(|e| e.message);
            sink.lock().unwrap().push(last);
        });
        slot.set(observer.clone()).unwrap();

        let _ = observer.track::<()>(Err(StoreError::new(StoreErrorKind::Connection, "down")));
        observer.clear();

        assert_eq!(*seen.lock().unwrap(), vec![Some("down".to_string()), None]);
    }
}
