//! Core lifecycle orchestration and the core-access façade.
//!
//! A [`Core`] is created once at process start. Every `start()` spawns one
//! run that walks the lifecycle:
//!
//! `PREPARING -> PREPARED -> STARTING -> STARTED -> STOPPING -> STOPPED`
//!
//! Proxies, connections and interceptors reach the active run through a
//! [`CoreHandle`]. The handle holds a weak reference to the run, so once the
//! run is over every façade call fails with [`CoreError::Inactive`].

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::CoreError;
use crate::interceptor::{
    ChainOutcome, Interceptor, InterceptorExecutor, InterceptorManager, PduSender,
};
use crate::listener::{ConnectionListener, CoreListener, ListenerRegistry};
use crate::module::{CoreModules, ModuleRegistry};
use crate::pdu::{Destination, Pdu};
use crate::proxy::{Proxy, ProxyExecutor, ProxyManager};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreState {
    Preparing,
    Prepared,
    Starting,
    Started,
    Stopping,
    #[default]
    Stopped,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoreState::Preparing => "PREPARING",
            CoreState::Prepared => "PREPARED",
            CoreState::Starting => "STARTING",
            CoreState::Started => "STARTED",
            CoreState::Stopping => "STOPPING",
            CoreState::Stopped => "STOPPED",
        })
    }
}

// =============================================================================
// Run
// =============================================================================

/// Executors of one run, built during PREPARING.
struct Pipeline {
    proxies: ProxyExecutor,
    c2s: InterceptorExecutor,
    s2c: InterceptorExecutor,
}

impl Pipeline {
    fn executor(&self, destination: Destination) -> &InterceptorExecutor {
        match destination {
            Destination::Server => &self.c2s,
            Destination::Client => &self.s2c,
        }
    }
}

/// Everything that lives exactly as long as one run.
struct Runtime {
    state: watch::Receiver<CoreState>,
    connection_listeners: Arc<ListenerRegistry<dyn ConnectionListener>>,
    pipeline: OnceLock<Pipeline>,
}

impl Runtime {
    fn pipeline(&self) -> Result<&Pipeline, CoreError> {
        self.pipeline.get().ok_or(CoreError::Inactive)
    }
}

struct RunControl {
    shutdown: watch::Sender<bool>,
    runtime: Arc<Runtime>,
    _task: JoinHandle<()>,
}

// =============================================================================
// Core-access façade
// =============================================================================

/// Access to the active core run.
///
/// Cheap to clone. Every operation fails with [`CoreError::Inactive`] when
/// the run it was created for is over (or has not built its pipeline yet).
#[derive(Clone)]
pub struct CoreHandle {
    runtime: Weak<Runtime>,
}

impl CoreHandle {
    fn new(runtime: &Arc<Runtime>) -> Self {
        Self {
            runtime: Arc::downgrade(runtime),
        }
    }

    /// A handle that is not attached to any run.
    pub fn detached() -> Self {
        Self {
            runtime: Weak::new(),
        }
    }

    fn runtime(&self) -> Result<Arc<Runtime>, CoreError> {
        self.runtime.upgrade().ok_or(CoreError::Inactive)
    }

    /// Whether the run behind this handle is still alive.
    pub fn is_active(&self) -> bool {
        self.runtime.strong_count() > 0
    }

    /// State of the run, `Stopped` once the run is gone.
    pub fn state(&self) -> CoreState {
        self.runtime
            .upgrade()
            .map_or(CoreState::Stopped, |runtime| *runtime.state.borrow())
    }

    /// Feed a PDU into the chain of its direction.
    ///
    /// A PDU carrying a last-interceptor marker resumes right after that
    /// stage, so stages it already passed never see it again.
    pub async fn process_pdu(&self, pdu: Pdu) -> Result<ChainOutcome, CoreError> {
        let from = pdu.last_interceptor().map_or(0, |id| id + 1);
        self.process_pdu_at(pdu, from).await
    }

    /// Feed a PDU into the chain of its direction starting at stage `from`.
    pub async fn process_pdu_at(&self, pdu: Pdu, from: usize) -> Result<ChainOutcome, CoreError> {
        let runtime = self.runtime()?;
        let executor = runtime.pipeline()?.executor(pdu.destination());
        executor.intercept_from(pdu, from).await
    }

    /// Bypass the chains and hand the PDU to its connection's outbound queue.
    pub fn send_pdu(&self, pdu: Pdu) -> Result<(), CoreError> {
        self.runtime()?;
        send_to_connection(pdu);
        Ok(())
    }

    pub fn proxies(&self) -> Result<Vec<Arc<dyn Proxy>>, CoreError> {
        let runtime = self.runtime()?;
        Ok(runtime.pipeline()?.proxies.manager().list().to_vec())
    }

    pub fn proxy(&self, code: &str) -> Result<Option<Arc<dyn Proxy>>, CoreError> {
        let runtime = self.runtime()?;
        Ok(runtime.pipeline()?.proxies.manager().get(code))
    }

    /// First proxy able to carry `pdu`.
    pub fn proxy_for(&self, pdu: &Pdu) -> Result<Option<Arc<dyn Proxy>>, CoreError> {
        Ok(self.proxies()?.into_iter().find(|proxy| proxy.supports(pdu)))
    }

    pub fn interceptors_c2s(&self) -> Result<Vec<Arc<dyn Interceptor>>, CoreError> {
        self.interceptors(Destination::Server)
    }

    pub fn interceptors_s2c(&self) -> Result<Vec<Arc<dyn Interceptor>>, CoreError> {
        self.interceptors(Destination::Client)
    }

    pub fn interceptor_c2s(&self, code: &str) -> Result<Option<Arc<dyn Interceptor>>, CoreError> {
        let runtime = self.runtime()?;
        Ok(runtime.pipeline()?.c2s.manager().get(code))
    }

    pub fn interceptor_s2c(&self, code: &str) -> Result<Option<Arc<dyn Interceptor>>, CoreError> {
        let runtime = self.runtime()?;
        Ok(runtime.pipeline()?.s2c.manager().get(code))
    }

    fn interceptors(&self, destination: Destination) -> Result<Vec<Arc<dyn Interceptor>>, CoreError> {
        let runtime = self.runtime()?;
        let manager = runtime.pipeline()?.executor(destination).manager();
        Ok(manager.list().to_vec())
    }

    /// Listener that fans events out to every registered connection listener.
    pub fn connection_listener(&self) -> Result<Arc<dyn ConnectionListener>, CoreError> {
        let runtime = self.runtime()?;
        let listeners: Arc<dyn ConnectionListener> = runtime.connection_listeners.clone();
        Ok(listeners)
    }

    pub fn register_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), CoreError> {
        self.runtime()?.connection_listeners.register(listener);
        Ok(())
    }

    pub fn unregister_connection_listener(
        &self,
        listener: &Arc<dyn ConnectionListener>,
    ) -> Result<bool, CoreError> {
        Ok(self.runtime()?.connection_listeners.unregister(listener))
    }
}

impl fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Terminal step of both chains.
fn send_to_connection(pdu: Pdu) {
    match pdu.connection() {
        Some(connection) => connection.send(pdu),
        None => debug!(
            direction = %pdu.destination(),
            size = pdu.size(),
            "Dropping PDU, connection is gone"
        ),
    }
}

// =============================================================================
// Core
// =============================================================================

struct Inner {
    registry: Arc<ModuleRegistry>,
    modules: RwLock<CoreModules>,
    listeners: ListenerRegistry<dyn CoreListener>,
    connection_listeners: Arc<ListenerRegistry<dyn ConnectionListener>>,
    state: watch::Sender<CoreState>,
    run: Mutex<Option<RunControl>>,
}

/// The lifecycle orchestrator.
///
/// At most one run is active at a time: `start` only acts on a stopped core
/// and `stop` only on a started one.
#[derive(Clone)]
pub struct Core {
    inner: Arc<Inner>,
}

impl Core {
    pub fn new(registry: Arc<ModuleRegistry>, modules: CoreModules) -> Self {
        let (state, _) = watch::channel(CoreState::Stopped);
        Self {
            inner: Arc::new(Inner {
                registry,
                modules: RwLock::new(modules),
                listeners: ListenerRegistry::new(),
                connection_listeners: Arc::new(ListenerRegistry::new()),
                state,
                run: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    pub fn modules(&self) -> CoreModules {
        self.inner
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the module lists. Takes effect on the next start.
    pub fn set_modules(&self, modules: CoreModules) {
        *self.inner.modules.write().unwrap_or_else(|e| e.into_inner()) = modules;
    }

    pub fn register_listener(&self, listener: Arc<dyn CoreListener>) {
        self.inner.listeners.register(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn CoreListener>) -> bool {
        self.inner.listeners.unregister(listener)
    }

    /// Connection listeners registered here outlive individual runs.
    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connection_listeners.register(listener);
    }

    pub fn state(&self) -> CoreState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoreState> {
        self.inner.state.subscribe()
    }

    /// Wait until the core reaches `target`.
    pub async fn wait_for_state(&self, target: CoreState) {
        let mut state = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = state.wait_for(|s| *s == target).await;
    }

    /// Handle to the active run, if any.
    pub fn handle(&self) -> CoreHandle {
        self.inner
            .lock_run()
            .as_ref()
            .map_or_else(CoreHandle::detached, |run| CoreHandle::new(&run.runtime))
    }

    /// Start a new run. Returns `false` (doing nothing) unless the core is
    /// stopped. Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut run = self.inner.lock_run();
        let accepted = self.inner.state.send_if_modified(|state| {
            if *state == CoreState::Stopped {
                *state = CoreState::Preparing;
                true
            } else {
                false
            }
        });
        if !accepted {
            debug!(state = %self.state(), "Ignoring start, core is not stopped");
            return false;
        }

        let runtime = Arc::new(Runtime {
            state: self.inner.state.subscribe(),
            connection_listeners: Arc::clone(&self.inner.connection_listeners),
            pipeline: OnceLock::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(
            Arc::clone(&self.inner)
                .drive(Arc::clone(&runtime), shutdown_rx)
                .instrument(info_span!("core")),
        );

        *run = Some(RunControl {
            shutdown: shutdown_tx,
            runtime,
            _task: task,
        });
        true
    }

    /// Request the active run to stop. Returns `false` (doing nothing) unless
    /// the core is started.
    pub fn stop(&self) -> bool {
        if self.state() != CoreState::Started {
            debug!(state = %self.state(), "Ignoring stop, core is not started");
            return false;
        }
        match self.inner.lock_run().as_ref() {
            Some(run) => run.shutdown.send_if_modified(|stop| !std::mem::replace(stop, true)),
            None => false,
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core").field("state", &self.state()).finish()
    }
}

impl Inner {
    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<RunControl>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CoreState) {
        self.state.send_replace(state);
        debug!(%state, "Core state changed");
    }

    async fn drive(self: Arc<Self>, runtime: Arc<Runtime>, shutdown: watch::Receiver<bool>) {
        self.run_phases(&runtime, shutdown).await;

        // Handles go inactive before anyone can observe STOPPED.
        drop(runtime);
        self.lock_run().take();
        self.set_state(CoreState::Stopped);
        info!("Core stopped");
    }

    async fn run_phases(&self, runtime: &Arc<Runtime>, mut shutdown: watch::Receiver<bool>) {
        let handle = CoreHandle::new(runtime);

        self.listeners.before_prepare(&handle);
        if let Err(e) = self.prepare(runtime, &handle).await {
            error!(error = %e, "Core failed to prepare");
            self.stop_sweep(runtime, &handle).await;
            return;
        }
        self.set_state(CoreState::Prepared);
        self.listeners.after_prepare(&handle);

        self.set_state(CoreState::Starting);
        self.listeners.before_start(&handle);
        if let Err(e) = self.start(runtime).await {
            error!(error = %e, "Core failed to start");
            self.stop_sweep(runtime, &handle).await;
            return;
        }
        self.set_state(CoreState::Started);
        self.listeners.after_start(&handle);
        info!("Core started");

        // Only a closed channel ends the wait early, and the sender outlives the run.
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Core stopping");
        self.stop_sweep(runtime, &handle).await;
    }

    async fn prepare(&self, runtime: &Runtime, handle: &CoreHandle) -> Result<(), CoreError> {
        let modules = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let proxies = ProxyManager::build(&self.registry, &modules.proxies, handle)?;
        let c2s = InterceptorManager::build(&self.registry, &modules.interceptors_c2s, handle)?;
        let s2c = InterceptorManager::build(&self.registry, &modules.interceptors_s2c, handle)?;
        info!(
            proxies = proxies.len(),
            interceptors_c2s = c2s.len(),
            interceptors_s2c = s2c.len(),
            "Core modules built"
        );

        let sender: PduSender = Arc::new(send_to_connection);
        let pipeline = runtime.pipeline.get_or_init(|| Pipeline {
            proxies: ProxyExecutor::new(proxies),
            c2s: InterceptorExecutor::new(Destination::Server, c2s, Arc::clone(&sender)),
            s2c: InterceptorExecutor::new(Destination::Client, s2c, sender),
        });

        pipeline.proxies.prepare().await?;
        pipeline.c2s.prepare().await?;
        pipeline.s2c.prepare().await?;
        Ok(())
    }

    async fn start(&self, runtime: &Runtime) -> Result<(), CoreError> {
        let pipeline = runtime.pipeline()?;
        pipeline.proxies.start().await?;
        pipeline.c2s.start();
        pipeline.s2c.start();
        Ok(())
    }

    /// Stop whatever the run managed to build.
    async fn stop_sweep(&self, runtime: &Runtime, handle: &CoreHandle) {
        self.set_state(CoreState::Stopping);
        self.listeners.before_stop(handle);

        if let Some(pipeline) = runtime.pipeline.get() {
            pipeline.proxies.stop().await;
            pipeline.c2s.stop().await;
            pipeline.s2c.stop().await;
        }

        self.listeners.after_stop(handle);
    }
}
