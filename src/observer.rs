// =============================================================================
// Observer lists — explicit subscriber registries with isolated dispatch
// =============================================================================
//
// A panicking handler is logged and counted; delivery continues to every
// other subscriber.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Append-only list of event handlers for events of type `T`.
pub struct Subscribers<T> {
    name: &'static str,
    handlers: RwLock<Vec<Handler<T>>>,
    failures: AtomicU64,
}

impl<T> Subscribers<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a handler. Handlers are never removed.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Deliver `event` to every handler. Returns how many handlers failed.
    pub fn publish(&self, event: &T) -> usize {
        // Clone the list so a handler may subscribe without deadlocking.
        let handlers: Vec<Handler<T>> = self.handlers.read().clone();
        let mut failed = 0;
        for (idx, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                failed += 1;
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(channel = self.name, handler = idx, "subscriber panicked during dispatch");
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Total handler failures since construction.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn panicking_handler_does_not_block_others() {
        let subs: Subscribers<u32> = Subscribers::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = seen.clone();
        subs.subscribe(move |v| {
            s1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        subs.subscribe(|_| panic!("boom"));
        let s3 = seen.clone();
        subs.subscribe(move |v| {
            s3.fetch_add(*v as usize, Ordering::SeqCst);
        });

        let failed = subs.publish(&5);
        assert_eq!(failed, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(subs.failure_count(), 1);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let subs: Subscribers<String> = Subscribers::new("empty");
        assert!(subs.is_empty());
        assert_eq!(subs.publish(&"x".to_string()), 0);
    }
}
