//! Process-wide notification registries for cross-cutting client events.
//!
//! Registries live for the whole process. The chat turn itself never publishes
//! or listens here.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ObserverRegistry<T> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, Observer<T>)>>,
}

/// Handle returned by [`ObserverRegistry::subscribe`].
pub struct Subscription<'a, T> {
    registry: &'a ObserverRegistry<T>,
    id: u64,
}

impl<T> Subscription<'_, T> {
    pub fn unsubscribe(self) {
        self.registry.remove(self.id);
    }
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Observer<T>)>> {
        match self.observers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription<'_, T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(observer)));
        Subscription { registry: self, id }
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|(existing, _)| *existing != id);
    }

    /// Calls every current observer. Observers may subscribe or unsubscribe while
    /// being notified; such changes apply from the next notification.
    pub fn notify(&self, event: &T) -> usize {
        let observers: Vec<Observer<T>> = self.lock().iter().map(|(_, o)| o.clone()).collect();
        for observer in &observers {
            observer(event);
        }
        observers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMismatch {
    pub client_version: String,
    pub server_version: String,
}

lazy_static! {
    pub static ref CLIENT_VERSION_MISMATCH: ObserverRegistry<VersionMismatch> =
        ObserverRegistry::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let registry = ObserverRegistry::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let first = registry.subscribe(move |n| {
            counter.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let counter = seen.clone();
        let _second = registry.subscribe(move |n| {
            counter.fetch_add(*n as usize * 10, Ordering::SeqCst);
        });

        assert_eq!(registry.notify(&1), 2);
        first.unsubscribe();
        assert_eq!(registry.notify(&1), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_observer_may_touch_registry_while_notified() {
        let registry = Arc::new(ObserverRegistry::<()>::new());
        let inner = registry.clone();
        let _sub = registry.subscribe(move |_| {
            assert_eq!(inner.len(), 1);
        });
        assert_eq!(registry.notify(&()), 1);
    }
}
