//! Lifecycle and connection listeners.

use std::sync::{Arc, RwLock};

use crate::connection::Connection;
use crate::engine::CoreHandle;

/// Hooks around the phases of a core run.
///
/// Every hook defaults to a no-op.
pub trait CoreListener: Send + Sync {
    fn before_prepare(&self, _core: &CoreHandle) {}
    fn after_prepare(&self, _core: &CoreHandle) {}
    fn before_start(&self, _core: &CoreHandle) {}
    fn after_start(&self, _core: &CoreHandle) {}
    fn before_stop(&self, _core: &CoreHandle) {}
    fn after_stop(&self, _core: &CoreHandle) {}
}

/// Notified when connections join or leave a connection manager.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_start(&self, connection: &Arc<dyn Connection>);
    fn on_connection_stop(&self, connection: &Arc<dyn Connection>);
}

/// Ordered set of listeners, compared by identity.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn register(&self, listener: Arc<L>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Snapshot of the registered listeners.
    ///
    /// Callbacks run on the snapshot so a listener may (un)register from
    /// inside a callback without deadlocking.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry<dyn CoreListener> {
    pub fn before_prepare(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.before_prepare(core));
    }

    pub fn after_prepare(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.after_prepare(core));
    }

    pub fn before_start(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.before_start(core));
    }

    pub fn after_start(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.after_start(core));
    }

    pub fn before_stop(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.before_stop(core));
    }

    pub fn after_stop(&self, core: &CoreHandle) {
        self.snapshot().iter().for_each(|l| l.after_stop(core));
    }
}

/// Fans connection events out to every registered listener.
impl ConnectionListener for ListenerRegistry<dyn ConnectionListener> {
    fn on_connection_start(&self, connection: &Arc<dyn Connection>) {
        for listener in self.snapshot() {
            listener.on_connection_start(connection);
        }
    }

    fn on_connection_stop(&self, connection: &Arc<dyn Connection>) {
        for listener in self.snapshot() {
            listener.on_connection_stop(connection);
        }
    }
}
