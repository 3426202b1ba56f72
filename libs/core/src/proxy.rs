//! Proxies and their orchestration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::connection::ConnectionManager;
use crate::engine::CoreHandle;
use crate::error::{CoreError, ProxyError};
use crate::module::{ModuleRegistry, ModuleSpec};
use crate::pdu::Pdu;

/// A running instance of one configured listener.
#[async_trait]
pub trait Proxy: Send + Sync + 'static {
    /// Code of the module this proxy was created from.
    fn code(&self) -> &str;

    /// Validate configuration and load resources. Nothing listens yet.
    async fn prepare(&self) -> Result<(), ProxyError>;

    /// Start accepting. Must return once the accept loop runs in its own task.
    async fn start(&self) -> Result<(), ProxyError>;

    /// Stop accepting and stop every connection. Idempotent.
    async fn stop(&self) -> Result<(), ProxyError>;

    /// Whether this proxy can carry `pdu` (used to route externally sourced PDUs).
    fn supports(&self, pdu: &Pdu) -> bool;

    fn connection_manager(&self) -> &ConnectionManager;
}

impl fmt::Debug for dyn Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy '{}'", self.code())
    }
}

/// Creates proxies of one kind.
pub trait ProxyFactory: Send + Sync {
    /// Registry code of this factory.
    fn code(&self) -> &str;

    fn create_proxy(&self, module: &ModuleSpec, core: CoreHandle) -> Result<Arc<dyn Proxy>, ProxyError>;
}

/// One proxy per enabled proxy module, in configured order.
pub struct ProxyManager {
    list: Vec<Arc<dyn Proxy>>,
    by_code: HashMap<String, Arc<dyn Proxy>>,
}

impl ProxyManager {
    /// Instantiate the enabled modules. Disabled modules are never created.
    pub fn build(
        registry: &ModuleRegistry,
        modules: &[ModuleSpec],
        core: &CoreHandle,
    ) -> Result<Self, CoreError> {
        let mut list = Vec::with_capacity(modules.len());
        for module in modules.iter().filter(|m| m.enabled) {
            let factory = registry.proxy_factory(module)?;
            list.push(factory.create_proxy(module, core.clone())?);
        }
        Ok(Self::from_list(list))
    }

    pub fn from_list(list: Vec<Arc<dyn Proxy>>) -> Self {
        let by_code = list
            .iter()
            .map(|p| (p.code().to_string(), Arc::clone(p)))
            .collect();
        Self { list, by_code }
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn Proxy>> {
        self.by_code.get(code).cloned()
    }

    pub fn list(&self) -> &[Arc<dyn Proxy>] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Runs lifecycle operations over every proxy of a run.
pub struct ProxyExecutor {
    manager: ProxyManager,
}

impl ProxyExecutor {
    pub fn new(manager: ProxyManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ProxyManager {
        &self.manager
    }

    /// Prepare proxies in order, stopping at the first failure.
    pub async fn prepare(&self) -> Result<(), ProxyError> {
        for proxy in self.manager.list() {
            proxy.prepare().await.inspect_err(|e| {
                error!(proxy = %proxy.code(), error = %e, "Proxy failed to prepare");
            })?;
        }
        Ok(())
    }

    /// Start proxies in order, stopping at the first failure.
    ///
    /// Proxies started before the failure keep running; the core's stop
    /// sweep is what cleans them up.
    pub async fn start(&self) -> Result<(), ProxyError> {
        for proxy in self.manager.list() {
            proxy.start().await.inspect_err(|e| {
                error!(proxy = %proxy.code(), error = %e, "Proxy failed to start");
            })?;
            info!(proxy = %proxy.code(), "Proxy started");
        }
        Ok(())
    }

    /// Stop every proxy. Failures are logged, never propagated.
    pub async fn stop(&self) {
        for proxy in self.manager.list() {
            if let Err(e) = proxy.stop().await {
                error!(proxy = %proxy.code(), error = %e, "Proxy failed to stop");
            }
        }
    }
}
