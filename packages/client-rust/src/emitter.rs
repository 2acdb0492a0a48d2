//! Minimal publish/subscribe primitive with listener-slot reuse.
//!
//! Listeners live in a slot vector. Unsubscribing empties a slot and pushes
//! its index onto a free stack, so the next subscriber reuses it instead of
//! growing the vector. `emit` snapshots the live listeners before invoking
//! them, so a listener may subscribe or unsubscribe from inside a callback.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    listeners: Vec<Option<Listener<T>>>,
    free: Vec<usize>,
}

/// Fan-out of `&T` notifications to registered listeners.
pub struct EventEmitter<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> EventEmitter<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                listeners: Vec::new(),
                free: Vec::new(),
            })),
        }
    }

    /// Registers a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let slot = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.free.pop() {
                slots.listeners[slot] = Some(listener);
                slot
            } else {
                slots.listeners.push(Some(listener));
                slots.listeners.len() - 1
            }
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    let mut slots = slots.lock();
                    if slots.listeners[slot].take().is_some() {
                        slots.free.push(slot);
                    }
                }
            })),
        }
    }

    /// Invokes every listener registered at the time of the call.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .slots
            .lock()
            .listeners
            .iter()
            .flatten()
            .cloned()
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.slots.lock().listeners.iter().flatten().count()
    }

    /// Number of allocated slots, live or free.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().listeners.len()
    }
}

impl<T: 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the listener registered for the emitter's whole lifetime.
    pub fn detach(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_every_listener() {
        let emitter = EventEmitter::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t1 = Arc::clone(&total);
        let t2 = Arc::clone(&total);
        let _a = emitter.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let _b = emitter.subscribe(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        emitter.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let emitter = EventEmitter::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = emitter.subscribe(move |()| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&());
        drop(sub);
        emitter.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let emitter = EventEmitter::<()>::new();
        let a = emitter.subscribe(|()| {});
        let _b = emitter.subscribe(|()| {});
        a.unsubscribe();
        let _c = emitter.subscribe(|()| {});

        assert_eq!(emitter.slot_count(), 2);
        assert_eq!(emitter.listener_count(), 2);
    }

    #[test]
    fn detached_listener_survives() {
        let emitter = EventEmitter::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        emitter
            .subscribe(move |()| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .detach();
        emitter.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_subscribe_during_emit() {
        let emitter = Arc::new(EventEmitter::<()>::new());
        let inner = Arc::clone(&emitter);
        let _outer = emitter.subscribe(move |()| {
            inner.subscribe(|()| {}).detach();
        });

        emitter.emit(&());
        assert_eq!(emitter.listener_count(), 2);
    }

    #[test]
    fn unsubscribe_after_emitter_dropped_is_harmless() {
        let emitter = EventEmitter::<()>::new();
        let sub = emitter.subscribe(|()| {});
        drop(emitter);
        sub.unsubscribe();
    }
}
