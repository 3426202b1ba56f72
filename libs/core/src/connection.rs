//! Connections and the per-proxy connection registry.
//!
//! A connection is one client <-> proxy <-> server session. Concrete
//! transports embed a [`ConnectionBase`] (code, owning proxy, core access and
//! the two outbound queues) and implement start/stop on top of it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::engine::CoreHandle;
use crate::error::{ConnectionError, CoreError};
use crate::listener::ConnectionListener;
use crate::pdu::{Destination, Pdu};
use crate::proxy::Proxy;
use crate::queue::PduQueue;

/// State shared by every connection implementation.
pub struct ConnectionBase {
    code: String,
    proxy: Option<Weak<dyn Proxy>>,
    core: CoreHandle,
    queue_c2s: PduQueue,
    queue_s2c: PduQueue,
}

impl ConnectionBase {
    pub fn new(code: impl Into<String>, proxy: Option<Weak<dyn Proxy>>, core: CoreHandle) -> Self {
        Self {
            code: code.into(),
            proxy,
            core,
            queue_c2s: PduQueue::new(),
            queue_s2c: PduQueue::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn proxy(&self) -> Option<Arc<dyn Proxy>> {
        self.proxy.as_ref().and_then(Weak::upgrade)
    }

    pub fn core(&self) -> &CoreHandle {
        &self.core
    }

    /// Outbound queue towards the server (drained by the server writer).
    pub fn queue_c2s(&self) -> &PduQueue {
        &self.queue_c2s
    }

    /// Outbound queue towards the client (drained by the client writer).
    pub fn queue_s2c(&self) -> &PduQueue {
        &self.queue_s2c
    }

    /// Hand a freshly read PDU to the interceptor chain of its direction.
    pub async fn process(&self, pdu: Pdu) -> Result<(), CoreError> {
        self.core.process_pdu(pdu).await.map(|_| ())
    }

    /// Close both outbound queues, releasing any blocked writer.
    pub fn close_queues(&self) {
        self.queue_c2s.close();
        self.queue_s2c.close();
    }
}

/// One proxied client <-> server session.
#[async_trait]
pub trait Connection: Any + Send + Sync {
    /// Shared connection state.
    fn base(&self) -> &ConnectionBase;

    /// Open the server side and spawn the I/O tasks.
    ///
    /// Must return once the tasks are running; blocking I/O never happens
    /// on the caller.
    async fn start(self: Arc<Self>) -> Result<(), ConnectionError>;

    /// Stop the connection. Idempotent and callable from any task; unblocks
    /// every pending read, write and queue take of this connection.
    fn stop(&self);

    /// Unique code within the owning proxy.
    fn code(&self) -> &str {
        self.base().code()
    }

    fn proxy(&self) -> Option<Arc<dyn Proxy>> {
        self.base().proxy()
    }

    /// Enqueue a PDU on the outbound queue matching its destination.
    fn send(&self, pdu: Pdu) {
        match pdu.destination() {
            Destination::Server => self.send_c2s(pdu),
            Destination::Client => self.send_s2c(pdu),
        }
    }

    fn send_c2s(&self, pdu: Pdu) {
        if !self.base().queue_c2s().add(pdu) {
            debug!(code = %self.code(), "Dropping C2S PDU, connection closed");
        }
    }

    fn send_s2c(&self, pdu: Pdu) {
        if !self.base().queue_s2c().add(pdu) {
            debug!(code = %self.code(), "Dropping S2C PDU, connection closed");
        }
    }

    /// Whether this connection's proxy can carry `pdu`.
    fn supports(&self, pdu: &Pdu) -> bool {
        self.proxy().is_some_and(|proxy| proxy.supports(pdu))
    }
}

impl dyn Connection {
    /// The concrete connection type, if it is `T`.
    pub fn downcast_ref<T: Connection>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

impl fmt::Display for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection '{}'", self.code())
    }
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Concurrent registry of the active connections of one proxy.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
    listener: Option<Arc<dyn ConnectionListener>>,
    last_code: AtomicU64,
}

impl ConnectionManager {
    /// Create a registry that reports to the core's connection listeners.
    pub fn new(core: &CoreHandle) -> Self {
        Self::with_listener(core.connection_listener().ok())
    }

    pub fn with_listener(listener: Option<Arc<dyn ConnectionListener>>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            listener,
            last_code: AtomicU64::new(0),
        }
    }

    /// Generate a fresh connection code.
    pub fn next_code(&self) -> String {
        (self.last_code.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Insert the connection unless its code is already taken.
    pub fn add(&self, connection: Arc<dyn Connection>) -> bool {
        {
            let mut connections = self.write();
            if connections.contains_key(connection.code()) {
                return false;
            }
            connections.insert(connection.code().to_string(), Arc::clone(&connection));
        }

        debug!(code = %connection.code(), "Connection registered");
        if let Some(listener) = &self.listener {
            listener.on_connection_start(&connection);
        }
        true
    }

    /// Remove exactly this connection instance.
    pub fn remove(&self, connection: &dyn Connection) -> bool {
        let removed = {
            let mut connections = self.write();
            match connections.get(connection.code()) {
                Some(existing) if same_instance(existing, connection) => {
                    connections.remove(connection.code())
                }
                _ => None,
            }
        };

        match removed {
            Some(connection) => {
                self.notify_stop(&connection);
                true
            }
            None => false,
        }
    }

    /// Remove whatever connection is registered under `code`.
    pub fn remove_code(&self, code: &str) -> Option<Arc<dyn Connection>> {
        let removed = self.write().remove(code);
        if let Some(connection) = &removed {
            self.notify_stop(connection);
        }
        removed
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn Connection>> {
        self.read().get(code).cloned()
    }

    /// Point-in-time snapshot of the registered connections.
    pub fn list(&self) -> Vec<Arc<dyn Connection>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stop every registered connection. No completion order is defined.
    pub fn stop(&self) {
        for connection in self.list() {
            connection.stop();
        }
    }

    fn notify_stop(&self, connection: &Arc<dyn Connection>) {
        debug!(code = %connection.code(), "Connection unregistered");
        if let Some(listener) = &self.listener {
            listener.on_connection_stop(connection);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Connection>>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Connection>>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn same_instance(registered: &Arc<dyn Connection>, connection: &dyn Connection) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(registered), connection as *const dyn Connection)
}
