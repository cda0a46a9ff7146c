//! Typed publish/subscribe dispatch
//!
//! Subscribers are invoked in registration order. The subscriber list is
//! copy-on-write, so publishing never holds the registry lock: an unsubscribe
//! racing a publish is best-effort, and an event already being dispatched may
//! still reach a just-cancelled subscriber.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: u64,
    callback: Callback<E>,
}

struct BusInner<E> {
    subscribers: Mutex<Arc<Vec<Subscriber<E>>>>,
    next_id: AtomicU64,
}

pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.subscribers.lock();
        let mut next: Vec<Subscriber<E>> = guard
            .iter()
            .map(|s| Subscriber {
                id: s.id,
                callback: s.callback.clone(),
            })
            .collect();
        next.push(Subscriber {
            id,
            callback: Arc::new(callback),
        });
        *guard = Arc::new(next);

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: &E) {
        let subscribers = self.inner.subscribers.lock().clone();
        for subscriber in subscribers.iter() {
            (subscriber.callback)(event);
        }
    }

    pub fn clear(&self) {
        *self.inner.subscribers.lock() = Arc::new(Vec::new());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping the handle does not
/// unsubscribe; call [`Subscription::cancel`] to stop further callbacks.
pub struct Subscription<E> {
    id: u64,
    inner: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut guard = inner.subscribers.lock();
            let next: Vec<Subscriber<E>> = guard
                .iter()
                .filter(|s| s.id != self.id)
                .map(|s| Subscriber {
                    id: s.id,
                    callback: s.callback.clone(),
                })
                .collect();
            *guard = Arc::new(next);
        }
    }
}
