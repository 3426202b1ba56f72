//! Interceptor chains.
//!
//! Each direction owns an ordered [`InterceptorManager`] built once per core
//! run from the enabled interceptor modules, and an [`InterceptorExecutor`]
//! that walks a PDU through that chain and hands it to the terminal sender.
//!
//! Chain execution runs on the caller's task. Per connection and direction
//! there is exactly one reader task calling into the executor, which is what
//! keeps PDUs of one stream in order; different connections run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::engine::CoreHandle;
use crate::error::{CoreError, InterceptorError};
use crate::module::{ModuleRegistry, ModuleSpec};
use crate::pdu::{Destination, Pdu};

/// What an interceptor did with a PDU.
#[derive(Debug)]
pub enum Verdict {
    /// Pass the PDU to the next stage.
    Forward(Pdu),
    /// The interceptor took ownership (held for later release, or dropped).
    Consumed,
}

/// Where a chain traversal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The PDU left the chain through the terminal sender.
    Sent,
    /// The interceptor with this id consumed the PDU.
    Consumed(usize),
}

/// One pipeline stage.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Position in the chain, fixed when the chain is built.
    fn id(&self) -> usize;

    /// Code of the module this interceptor was created from.
    fn code(&self) -> &str;

    /// Called once before the core starts. An error aborts the startup.
    async fn prepare(&self) -> Result<(), InterceptorError> {
        Ok(())
    }

    /// Inspect or mutate a PDU.
    ///
    /// Must not wait indefinitely: an interceptor that wants to pause a PDU
    /// stores it (e.g. in a [`crate::PduQueue`]) and returns
    /// [`Verdict::Consumed`].
    async fn intercept(&self, pdu: Pdu) -> Result<Verdict, InterceptorError>;

    /// Release resources. Idempotent.
    async fn stop(&self) {}
}

impl fmt::Debug for dyn Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interceptor '{}' #{}", self.code(), self.id())
    }
}

/// Creates interceptors of one kind.
pub trait InterceptorFactory: Send + Sync {
    /// Registry code of this factory.
    fn code(&self) -> &str;

    fn create_interceptor(
        &self,
        id: usize,
        module: &ModuleSpec,
        core: CoreHandle,
    ) -> Result<Arc<dyn Interceptor>, InterceptorError>;
}

/// Fixed, ordered interceptor list for one direction.
pub struct InterceptorManager {
    list: Vec<Arc<dyn Interceptor>>,
    by_code: HashMap<String, Arc<dyn Interceptor>>,
}

impl InterceptorManager {
    /// Instantiate the enabled modules in order. Ids are dense over the
    /// enabled modules.
    pub fn build(
        registry: &ModuleRegistry,
        modules: &[ModuleSpec],
        core: &CoreHandle,
    ) -> Result<Self, CoreError> {
        let mut list: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(modules.len());
        for module in modules.iter().filter(|m| m.enabled) {
            let factory = registry.interceptor_factory(module)?;
            let interceptor = factory.create_interceptor(list.len(), module, core.clone())?;
            list.push(interceptor);
        }
        Ok(Self::from_list(list))
    }

    pub fn from_list(list: Vec<Arc<dyn Interceptor>>) -> Self {
        let by_code = list
            .iter()
            .map(|i| (i.code().to_string(), Arc::clone(i)))
            .collect();
        Self { list, by_code }
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn Interceptor>> {
        self.by_code.get(code).cloned()
    }

    pub fn list(&self) -> &[Arc<dyn Interceptor>] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Terminal callback that forwards a PDU out of the engine.
pub type PduSender = Arc<dyn Fn(Pdu) + Send + Sync>;

/// Drives PDUs through one direction's chain.
pub struct InterceptorExecutor {
    destination: Destination,
    manager: InterceptorManager,
    sender: PduSender,
    running: AtomicBool,
}

impl InterceptorExecutor {
    pub fn new(destination: Destination, manager: InterceptorManager, sender: PduSender) -> Self {
        Self {
            destination,
            manager,
            sender,
            running: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &InterceptorManager {
        &self.manager
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    /// Prepare every interceptor in order, stopping at the first failure.
    pub async fn prepare(&self) -> Result<(), InterceptorError> {
        for interceptor in self.manager.list() {
            interceptor.prepare().await.inspect_err(|e| {
                error!(
                    direction = %self.destination,
                    interceptor = %interceptor.code(),
                    error = %e,
                    "Interceptor failed to prepare"
                );
            })?;
        }
        Ok(())
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        info!(
            direction = %self.destination,
            interceptors = self.manager.len(),
            "Interceptor chain started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop every interceptor.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for interceptor in self.manager.list() {
            interceptor.stop().await;
        }
        debug!(direction = %self.destination, "Interceptor chain stopped");
    }

    /// Run a PDU through the whole chain.
    pub async fn intercept(&self, pdu: Pdu) -> Result<ChainOutcome, CoreError> {
        self.intercept_from(pdu, 0).await
    }

    /// Run a PDU through the chain starting at stage `from`.
    ///
    /// Stages before `from` are never invoked; `from == len` sends the PDU
    /// straight out. Interceptor errors are returned to the caller, not
    /// swallowed.
    pub async fn intercept_from(&self, mut pdu: Pdu, from: usize) -> Result<ChainOutcome, CoreError> {
        let len = self.manager.len();
        if from > len {
            return Err(CoreError::UnknownInterceptor {
                destination: self.destination,
                index: from,
                len,
            });
        }

        for interceptor in &self.manager.list()[from..] {
            // Marked before the call so a consumed PDU resumes after this stage.
            pdu.set_last_interceptor(Some(interceptor.id()));
            match interceptor.intercept(pdu).await? {
                Verdict::Forward(next) => pdu = next,
                Verdict::Consumed => return Ok(ChainOutcome::Consumed(interceptor.id())),
            }
        }

        (self.sender)(pdu);
        Ok(ChainOutcome::Sent)
    }
}
