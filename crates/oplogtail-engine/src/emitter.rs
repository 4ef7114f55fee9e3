//! Listener registry shared by the engine and its sub-filters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event::Signal;

/// Callback invoked with each emitted event
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E> {
    id: u64,
    signal: Signal,
    once: bool,
    listener: Listener<E>,
}

struct Registry<E> {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration<E>>>,
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: u64) -> bool;
}

impl<E> Deregister for Registry<E> {
    fn deregister(&self, id: u64) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }
}

/// Ordered set of listeners keyed by signal.
///
/// Listeners run synchronously in registration order on the emitting task.
/// They may register or remove listeners (including themselves) while an
/// event is being dispatched; such changes apply from the next emit.
pub struct Emitter<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                registrations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener for every emit of `signal`
    pub fn on<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(signal, false, Arc::new(listener))
    }

    /// Register a listener removed after its first call
    pub fn once<F>(&self, signal: Signal, listener: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(signal, true, Arc::new(listener))
    }

    fn register(&self, signal: Signal, once: bool, listener: Listener<E>) -> ListenerHandle {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.registrations.lock().push(Registration {
            id,
            signal: signal.clone(),
            once,
            listener,
        });

        let registry: Arc<dyn Deregister> = self.registry.clone();
        ListenerHandle {
            id,
            signal,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Call every listener registered for `signal`. Returns how many ran.
    pub fn emit(&self, signal: &Signal, event: &E) -> usize {
        let listeners: Vec<Listener<E>> = {
            let mut registrations = self.registry.registrations.lock();
            let matched = registrations
                .iter()
                .filter(|r| &r.signal == signal)
                .map(|r| Arc::clone(&r.listener))
                .collect();
            registrations.retain(|r| !(r.once && &r.signal == signal));
            matched
        };

        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Drop every registration
    pub fn remove_all(&self) {
        self.registry.registrations.lock().clear();
    }

    pub fn listener_count(&self, signal: &Signal) -> usize {
        self.registry
            .registrations
            .lock()
            .iter()
            .filter(|r| &r.signal == signal)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.registrations.lock().is_empty()
    }
}

/// Handle to a registered listener
#[derive(Clone)]
pub struct ListenerHandle {
    id: u64,
    signal: Signal,
    registry: Weak<dyn Deregister>,
}

impl ListenerHandle {
    /// Remove the listener. Returns false if it was already gone.
    pub fn remove(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.deregister(self.id))
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("signal", &self.signal)
            .finish()
    }
}
