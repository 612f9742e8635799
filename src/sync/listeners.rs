//! Listener registry with snapshot-on-notify
//!
//! Notification clones the listener list under the lock and calls it after the
//! lock is released, so a listener may add or remove listeners (or trigger
//! another notification) without deadlocking.

use std::sync::{Arc, Mutex};

/// Handle returned by [`Listeners::add`], used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<L: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<L>)>,
}

pub struct Listeners<L: ?Sized> {
    registry: Mutex<Registry<L>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let mut registry = self.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, listener));
        id
    }

    /// Returns whether the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _)| *entry_id != id);
        registry.entries.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Call `f` on every listener, in registration order
    pub fn notify(&self, mut f: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            f(&listener);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<L>> {
        // A listener that panicked mid-notify does not corrupt the list
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Tag(&'static str);

    impl Named for Tag {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_notify_in_registration_order() {
        let listeners: Listeners<dyn Named> = Listeners::new();
        listeners.add(Arc::new(Tag("a")));
        listeners.add(Arc::new(Tag("b")));
        listeners.add(Arc::new(Tag("c")));

        let mut seen = Vec::new();
        listeners.notify(|l| seen.push(l.name().to_string()));
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn test_remove() {
        let listeners: Listeners<dyn Named> = Listeners::new();
        let a = listeners.add(Arc::new(Tag("a")));
        listeners.add(Arc::new(Tag("b")));

        assert!(listeners.remove(a));
        assert!(!listeners.remove(a));
        assert_eq!(listeners.len(), 1);

        let mut seen = Vec::new();
        listeners.notify(|l| seen.push(l.name().to_string()));
        assert_eq!(seen, ["b"]);
    }

    #[test]
    fn test_listener_may_mutate_registry_during_notify() {
        let listeners: Arc<Listeners<dyn Named>> = Arc::new(Listeners::new());
        listeners.add(Arc::new(Tag("a")));

        let mut calls = 0;
        listeners.notify(|_| {
            calls += 1;
            listeners.add(Arc::new(Tag("late")));
        });

        // The late listener was not part of the snapshot
        assert_eq!(calls, 1);
        assert_eq!(listeners.len(), 2);
    }
}
