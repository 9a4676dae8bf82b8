use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> Slot<T> {
    fn silence(&self) {
        lock(&self.callback).take();
    }
}

struct Registry<T> {
    next_id: u64,
    slots: BTreeMap<u64, Arc<Slot<T>>>,
}

pub(crate) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A set of callbacks notified in registration order
///
/// Once [`Subscription::unsubscribe`] (or [`Listeners::clear`]) returns, the
/// affected callbacks will not be invoked again; a delivery already running
/// on another thread is waited for. A callback must not cancel its own
/// subscription from inside the callback.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    /// Create an empty listener set
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                slots: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let slot = Arc::new(Slot {
            callback: Mutex::new(Some(Box::new(callback) as Callback<T>)),
        });

        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.slots.insert(id, slot);
            id
        };

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let removed = lock(&registry).slots.remove(&id);
                if let Some(slot) = removed {
                    slot.silence();
                }
            })),
        }
    }

    /// Deliver `value` to every registered callback
    pub fn emit(&self, value: &T) {
        let slots: Vec<Arc<Slot<T>>> = lock(&self.registry).slots.values().cloned().collect();

        for slot in slots {
            let callback = lock(&slot.callback);
            if let Some(callback) = callback.as_ref() {
                callback(value);
            }
        }
    }

    /// Drop every registered callback
    pub fn clear(&self) {
        let slots = std::mem::take(&mut lock(&self.registry).slots);
        for slot in slots.into_values() {
            slot.silence();
        }
    }

    /// Number of registered callbacks
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registry).slots.len()
    }

    /// Whether no callbacks are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &lock(&self.registry).slots.len())
            .finish()
    }
}

/// Cancellation handle for a registered callback
///
/// Dropping the handle unsubscribes as well.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop delivery to this callback
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the callback registered for as long as its listener set lives
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
