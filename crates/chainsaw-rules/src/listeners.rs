use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Handle returned by [`Listeners::subscribe`], used to unsubscribe
pub type ListenerId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of subscribers for one kind of notification.
///
/// Callbacks run synchronously on the thread that calls [`emit`](Self::emit),
/// in subscription order. The list lock is released before callbacks run, so a
/// callback may subscribe or unsubscribe without deadlocking.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Deliver an event to every current subscriber
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_subscription_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            listeners.subscribe(move |n: &u32| seen.lock().push(format!("{}{}", tag, n)));
        }

        listeners.emit(&1);
        assert_eq!(*seen.lock(), vec!["a1".to_string(), "b1".to_string()]);
    }

    #[test]
    fn test_unsubscribe() {
        let listeners: Listeners<()> = Listeners::new();
        let id = listeners.subscribe(|_| {});
        assert_eq!(listeners.len(), 1);
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let slot = Arc::new(Mutex::new(None));
        let id = {
            let inner = Arc::clone(&listeners);
            let slot = Arc::clone(&slot);
            listeners.subscribe(move |_| {
                if let Some(id) = slot.lock().take() {
                    inner.unsubscribe(id);
                }
            })
        };
        *slot.lock() = Some(id);

        listeners.emit(&());
        assert!(listeners.is_empty());
    }
}
