use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Observer of one kind of event.
///
/// Implementors must be thread-safe since notifications are dispatched from
/// the tasks driving the connections.
pub trait Subscriber<E>: Send + Sync {
    /// A stable unique identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;

    /// Diagnostic lines from the pipeline.
    fn log(&self, _message: String) {}

    fn notify(&self, event: E);
}

/// Shared subscriber list keyed by [`Subscriber::get_id`].
///
/// Clones share the same list. Events reach each subscriber in the order
/// they were emitted.
pub struct Subscribers<E> {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Subscriber<E>>>>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate IDs replace the previous subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<E>>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber.get_id(), subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn Subscriber<E>>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscriber.get_id());
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: E) {
        for subscriber in self.snapshot() {
            subscriber.notify(event.clone());
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        for subscriber in self.snapshot() {
            subscriber.log(message.clone());
        }
    }

    // Subscribers run outside the lock so they may (un)subscribe themselves.
    fn snapshot(&self) -> Vec<Arc<dyn Subscriber<E>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
