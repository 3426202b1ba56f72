use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::Deserialize;

use interpose_core::{
    ChainOutcome, Connection, ConnectionBase, ConnectionError, ConnectionManager, CoreError,
    CoreHandle, Destination, ModuleSpec, Pdu, Proxy, ProxyError, ProxyFactory,
};

use crate::{Trace, TEST_PROXY};

/// Protocol marker of PDUs produced by [`TestConnection`].
pub const TEST_PROTOCOL: &str = "test";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TestProxyConfig {
    fail_prepare: bool,
    fail_start: bool,
}

/// In-memory proxy: connections are opened by the test, not by a socket.
pub struct TestProxy {
    code: String,
    core: CoreHandle,
    config: TestProxyConfig,
    trace: Trace,
    connections: ConnectionManager,
    running: AtomicBool,
    this: Weak<TestProxy>,
}

impl TestProxy {
    /// Open a connection owned by this proxy and register it.
    pub async fn open_connection(&self) -> Arc<TestConnection> {
        let proxy: Option<Weak<dyn Proxy>> = self.this.upgrade().map(|p| {
            let p: Arc<dyn Proxy> = p;
            Arc::downgrade(&p)
        });
        let connection = Arc::new(TestConnection {
            base: ConnectionBase::new(self.connections.next_code(), proxy, self.core.clone()),
            stopped: AtomicBool::new(false),
        });
        self.connections.add(connection.clone());
        let _ = Arc::clone(&connection).start().await;
        connection
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxy for TestProxy {
    fn code(&self) -> &str {
        &self.code
    }

    async fn prepare(&self) -> Result<(), ProxyError> {
        self.trace.lifecycle(&self.code, "prepare");
        if self.config.fail_prepare {
            return Err(ProxyError::Config("scripted prepare failure".to_string()));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), ProxyError> {
        self.trace.lifecycle(&self.code, "start");
        if self.config.fail_start {
            return Err(ProxyError::Config("scripted start failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.trace.lifecycle(&self.code, "stop");
        self.running.store(false, Ordering::SeqCst);
        self.connections.stop();
        Ok(())
    }

    fn supports(&self, pdu: &Pdu) -> bool {
        pdu.protocol() == TEST_PROTOCOL
    }

    fn connection_manager(&self) -> &ConnectionManager {
        &self.connections
    }
}

/// Connection whose "sockets" are the test itself.
pub struct TestConnection {
    base: ConnectionBase,
    stopped: AtomicBool,
}

impl TestConnection {
    /// Feed bytes into the engine as if read from the peer opposite `destination`.
    pub async fn receive(
        self: &Arc<Self>,
        destination: Destination,
        bytes: &[u8],
    ) -> Result<ChainOutcome, CoreError> {
        let connection: Arc<dyn Connection> = self.clone();
        let pdu = Pdu::from_connection(&connection, destination, bytes.to_vec(), bytes.len())
            .with_protocol(TEST_PROTOCOL);
        self.base.core().process_pdu(pdu).await
    }

    /// Next PDU headed to `destination`, or `None` once stopped.
    pub async fn outgoing(&self, destination: Destination) -> Option<Pdu> {
        match destination {
            Destination::Server => self.base.queue_c2s().take().await,
            Destination::Client => self.base.queue_s2c().take().await,
        }
    }

    /// PDU headed to `destination`, without waiting.
    pub fn poll_outgoing(&self, destination: Destination) -> Option<Pdu> {
        match destination {
            Destination::Server => self.base.queue_c2s().poll(),
            Destination::Client => self.base.queue_s2c().poll(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.base.close_queues();
        if let Some(proxy) = self.proxy() {
            proxy.connection_manager().remove(self);
        }
    }
}

/// Builds [`TestProxy`]s and keeps them reachable by module code.
pub struct TestProxyFactory {
    trace: Trace,
    created: Mutex<HashMap<String, Arc<TestProxy>>>,
}

impl TestProxyFactory {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Most recently created proxy for `module`.
    pub fn proxy(&self, module: &str) -> Option<Arc<TestProxy>> {
        self.created.lock().unwrap().get(module).cloned()
    }

    /// Module spec for this factory.
    pub fn module(code: &str) -> ModuleSpec {
        ModuleSpec::new(code, TEST_PROXY)
    }
}

impl ProxyFactory for TestProxyFactory {
    fn code(&self) -> &str {
        TEST_PROXY
    }

    fn create_proxy(&self, module: &ModuleSpec, core: CoreHandle) -> Result<Arc<dyn Proxy>, ProxyError> {
        let config: TestProxyConfig = module.parse_config()?;
        let proxy = Arc::new_cyclic(|this| TestProxy {
            code: module.code.clone(),
            connections: ConnectionManager::new(&core),
            core,
            config,
            trace: self.trace.clone(),
            running: AtomicBool::new(false),
            this: this.clone(),
        });
        self.created
            .lock()
            .unwrap()
            .insert(module.code.clone(), Arc::clone(&proxy));
        Ok(proxy)
    }
}
