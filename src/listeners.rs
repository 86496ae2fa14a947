//! Minimal notification bus.
//!
//! Listeners take no arguments: a notification only says that state changed,
//! observers re-query the registry themselves.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::debug;

/// Handle returned by [`Listeners::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    id: ListenerId,
    once: bool,
    callback: Callback,
}

/// Ordered list of zero-argument listeners.
#[derive(Default)]
pub struct Listeners {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, once: bool, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Binding listener {:?}", id);
        self.lock().push(Entry { id, once, callback });
        id
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.add(false, Arc::new(listener))
    }

    /// Subscribe for the next notification only.
    pub fn subscribe_once(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.add(true, Arc::new(listener))
    }

    /// Remove a listener. Returns whether it was still subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if removed {
            debug!("Unbinding listener {:?}", id);
        }
        removed
    }

    /// Resolves on the next [`fire`](Self::fire) after this call.
    ///
    /// The subscription is taken immediately, not when the future is first
    /// polled. Resolves immediately if the bus is cleared before firing.
    pub fn notified(&self) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Mutex::new(Some(tx));
        self.subscribe_once(move || {
            if let Some(tx) = tx.lock().ok().and_then(|mut tx| tx.take()) {
                let _ = tx.send(());
            }
        });
        async move {
            let _ = rx.await;
        }
    }

    /// Call every listener in subscription order.
    ///
    /// Listeners run outside the internal lock, so they may subscribe or
    /// unsubscribe. One-shot listeners are removed before they run.
    pub fn fire(&self) {
        let callbacks: Vec<Callback> = {
            let mut entries = self.lock();
            let callbacks = entries.iter().map(|e| Arc::clone(&e.callback)).collect();
            entries.retain(|entry| !entry.once);
            callbacks
        };

        debug!("Notifying {} listeners", callbacks.len());
        for callback in callbacks {
            callback();
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}
