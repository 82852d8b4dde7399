//! Store events
//!
//! Named events with a JSON payload. Synchronous listeners are registered
//! with [`Emitter::on`] / [`Emitter::once`]; async consumers take a
//! broadcast receiver from [`Emitter::subscribe`].

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for async subscribers
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Event name used for connection-level failures
pub const ERROR_EVENT: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreEvent {
    pub name: String,
    pub payload: Value,
}

/// Handle returned on registration, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    event: String,
    once: bool,
    callback: Callback,
}

pub struct Emitter {
    sender: broadcast::Sender<Arc<StoreEvent>>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl Emitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `callback` every time `event` is emitted
    pub fn on(&self, event: &str, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(event, false, Arc::new(callback))
    }

    /// Call `callback` the next time `event` is emitted only
    pub fn once(&self, event: &str, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> ListenerId {
        self.register(event, true, Arc::new(callback))
    }

    fn register(&self, event: &str, once: bool, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Listener { id, event: event.to_string(), once, callback });
        trace!(event = %event, once, "Listener registered");
        id
    }

    /// Remove a listener; false when it was already gone
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoreEvent>> {
        self.sender.subscribe()
    }

    /// Emit an event. Returns how many synchronous listeners were called.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        let event = Arc::new(StoreEvent { name: event.to_string(), payload });

        // Listeners run outside the lock so they may register or remove
        let callbacks: Vec<Callback> = {
            let mut listeners = self.lock();
            let callbacks = listeners
                .iter()
                .filter(|l| l.event == event.name)
                .map(|l| Arc::clone(&l.callback))
                .collect();
            listeners.retain(|l| !(l.once && l.event == event.name));
            callbacks
        };

        for callback in &callbacks {
            callback(event.as_ref());
        }

        let receivers = self.sender.send(Arc::clone(&event)).unwrap_or(0);
        debug!(event = %event.name, listeners = callbacks.len(), receivers, "Event emitted");
        callbacks.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().iter().filter(|l| l.event == event).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}
