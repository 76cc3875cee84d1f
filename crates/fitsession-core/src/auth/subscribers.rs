//! Observer registry for identity changes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::models::Identity;

/// Callback invoked with the current identity, or `None` when signed out.
pub type Listener = Arc<dyn Fn(Option<&Identity>) + Send + Sync>;

type Registry = Mutex<Entries>;

/// One queued call: `identity` goes to every listener in `listeners`.
struct Delivery {
    listeners: Vec<Listener>,
    identity: Option<Identity>,
}

#[derive(Default)]
struct Entries {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
    pending: VecDeque<Delivery>,
    delivering: bool,
}

/// Subscriber list owned by a `SessionManager`.
///
/// Listeners are called in registration order, outside the registry lock, so a
/// listener may subscribe, unsubscribe or call back into the session.
/// Deliveries are queued and drained by one caller at a time, so every
/// listener sees changes in the order they were raised, including changes
/// raised from inside another listener.
#[derive(Default)]
pub struct Subscribers {
    registry: Arc<Registry>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> Subscription {
        let mut entries = lock(&self.registry);
        self.insert(&mut entries, listener)
    }

    /// Register `listener` and deliver `current()` to it first.
    ///
    /// `current` runs under the registry lock: any change notified after it
    /// returns is queued behind the snapshot.
    pub fn add_with_snapshot<F>(&self, listener: Listener, current: F) -> Subscription
    where
        F: FnOnce() -> Option<Identity>,
    {
        let subscription = {
            let mut entries = lock(&self.registry);
            let subscription = self.insert(&mut entries, listener.clone());
            let identity = current();
            entries.pending.push_back(Delivery {
                listeners: vec![listener],
                identity,
            });
            subscription
        };
        self.deliver();
        subscription
    }

    pub fn notify(&self, identity: Option<&Identity>) {
        {
            let mut entries = lock(&self.registry);
            let listeners = entries.listeners.values().cloned().collect();
            entries.pending.push_back(Delivery {
                listeners,
                identity: identity.cloned(),
            });
        }
        self.deliver();
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, entries: &mut Entries, listener: Listener) -> Subscription {
        let id = entries.next_id;
        entries.next_id += 1;
        entries.listeners.insert(id, listener);

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Drain the queue unless another caller already is.
    fn deliver(&self) {
        {
            let mut entries = lock(&self.registry);
            if entries.delivering {
                return;
            }
            entries.delivering = true;
        }
        let _draining = Draining {
            registry: &self.registry,
        };

        loop {
            let next = {
                let mut entries = lock(&self.registry);
                match entries.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        entries.delivering = false;
                        return;
                    }
                }
            };
            for listener in &next.listeners {
                listener(next.identity.as_ref());
            }
        }
    }
}

/// Hands draining back if a listener panics.
struct Draining<'a> {
    registry: &'a Registry,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(self.registry).delivering = false;
        }
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keep the listener registered for as long as the session lives.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, Entries> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let listener: Listener = Arc::new(move |_: Option<&Identity>| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn test_notify_reaches_every_listener() {
        let subscribers = Subscribers::new();
        let (a, listener_a) = counter();
        let (b, listener_b) = counter();
        let _sub_a = subscribers.add(listener_a);
        let _sub_b = subscribers.add(listener_b);

        subscribers.notify(None);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_leaves_others_registered() {
        let subscribers = Subscribers::new();
        let (a, listener_a) = counter();
        let (b, listener_b) = counter();
        let sub_a = subscribers.add(listener_a);
        let _sub_b = subscribers.add(listener_b);

        sub_a.unsubscribe();
        assert_eq!(subscribers.len(), 1);

        subscribers.notify(None);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_subscription_stays_registered() {
        let subscribers = Subscribers::new();
        let (count, listener) = counter();
        subscribers.add(listener).detach();

        subscribers.notify(None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_same_closure_registered_twice_is_two_subscriptions() {
        let subscribers = Subscribers::new();
        let (count, listener) = counter();
        let first = subscribers.add(listener.clone());
        let _second = subscribers.add(listener);

        drop(first);
        subscribers.notify(None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_unsubscribe_during_notify() {
        let subscribers = Arc::new(Subscribers::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let sub = subscribers.add(Arc::new(move |_: Option<&Identity>| {
            inner.lock().unwrap().take();
        }));
        *slot.lock().unwrap() = Some(sub);

        subscribers.notify(None);
        assert!(subscribers.is_empty());
    }

    fn identity(email: &str) -> Identity {
        Identity {
            id: "1".to_string(),
            email: email.to_string(),
            name: "Test".to_string(),
            picture: None,
            provider: None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<Option<String>>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |identity: Option<&Identity>| {
            sink.lock().unwrap().push(identity.map(|i| i.email.clone()));
        });
        (seen, listener)
    }

    #[test]
    fn test_snapshot_is_delivered_first() {
        let subscribers = Subscribers::new();
        let (seen, listener) = recorder();
        let _sub = subscribers.add_with_snapshot(listener, || Some(identity("a@b.com")));

        subscribers.notify(None);
        assert_eq!(*seen.lock().unwrap(), vec![Some("a@b.com".to_string()), None]);
    }

    #[test]
    fn test_change_raised_inside_listener_is_delivered_in_order() {
        let subscribers = Arc::new(Subscribers::new());

        // The first listener answers a sign-in by signing out again.
        let reentrant = subscribers.clone();
        let _first = subscribers.add(Arc::new(move |who: Option<&Identity>| {
            if who.is_some() {
                reentrant.notify(None);
            }
        }));
        let (seen, listener) = recorder();
        let _second = subscribers.add(listener);

        subscribers.notify(Some(&identity("a@b.com")));
        assert_eq!(*seen.lock().unwrap(), vec![Some("a@b.com".to_string()), None]);
    }

    #[test]
    fn test_snapshot_taken_during_delivery_is_not_overtaken() {
        let subscribers = Arc::new(Subscribers::new());
        let (seen, late) = recorder();

        // Subscribes a new listener mid-delivery, then raises a newer change.
        let inner = subscribers.clone();
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let keep = held.clone();
        let _trigger = subscribers.add(Arc::new(move |who: Option<&Identity>| {
            if who.is_some_and(|i| i.email == "a@b.com") {
                let sub = inner.add_with_snapshot(late.clone(), || Some(identity("a@b.com")));
                keep.lock().unwrap().push(sub);
                inner.notify(Some(&identity("c@d.com")));
            }
        }));

        subscribers.notify(Some(&identity("a@b.com")));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("a@b.com".to_string()), Some("c@d.com".to_string())]
        );
    }

    #[test]
    fn test_delivery_recovers_after_listener_panics() {
        let subscribers = Arc::new(Subscribers::new());
        let _bad = subscribers.add(Arc::new(|who: Option<&Identity>| {
            if who.is_some() {
                panic!("listener failure");
            }
        }));
        let (seen, listener) = recorder();
        let _good = subscribers.add(listener);

        let panicking = subscribers.clone();
        let result = std::thread::spawn(move || panicking.notify(Some(&identity("a@b.com")))).join();
        assert!(result.is_err());

        subscribers.notify(None);
        assert_eq!(seen.lock().unwrap().last(), Some(&None));
    }
}
