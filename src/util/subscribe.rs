use std::sync::Arc;

use crate::firestore::error::FirestoreError;

pub type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
pub type ErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Callback pair handed to listeners. Either half may be absent.
pub struct PartialObserver<T, E = FirestoreError> {
    pub next: Option<NextFn<T>>,
    pub error: Option<ErrorFn<E>>,
}

impl<T, E> PartialObserver<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }

    pub fn notify_next(&self, value: &T) {
        if let Some(next) = &self.next {
            next(value);
        }
    }

    pub fn notify_error(&self, error: &E) {
        if let Some(callback) = &self.error {
            callback(error);
        }
    }
}

impl<T, E> Clone for PartialObserver<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T, E> Default for PartialObserver<T, E> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
        }
    }
}
