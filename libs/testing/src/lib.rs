//! Shared test fixtures.
//!
//! - [`Trace`]: ordered record of what fixtures observed
//! - [`ScriptedInterceptor`] and its factory: interceptors driven by module config
//! - [`TestProxy`] / [`TestConnection`]: an in-memory transport
//! - [`fixture_registry`]: a [`ModuleRegistry`] with both factories registered

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interpose_core::{Destination, ModuleRegistry};

mod interceptor;
mod proxy;

pub use interceptor::{Behavior, ScriptedInterceptor, ScriptedInterceptorFactory};
pub use proxy::{TestConnection, TestProxy, TestProxyFactory, TEST_PROTOCOL};

/// Factory code of [`ScriptedInterceptorFactory`].
pub const SCRIPTED_INTERCEPTOR: &str = "scripted";

/// Factory code of [`TestProxyFactory`].
pub const TEST_PROXY: &str = "test";

/// Install a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,interpose_core=debug,interpose_tcp=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Something a fixture observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An interceptor saw a PDU.
    Intercepted {
        module: String,
        destination: Destination,
        payload: Vec<u8>,
    },
    /// A module went through a lifecycle phase ("prepare", "start", "stop").
    Lifecycle { module: String, phase: &'static str },
}

/// Cheaply cloneable, ordered event log shared between fixtures.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: TraceEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn lifecycle(&self, module: &str, phase: &'static str) {
        self.push(TraceEvent::Lifecycle {
            module: module.to_string(),
            phase,
        });
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(module, destination, payload)` of every intercepted PDU, in order.
    pub fn intercepted(&self) -> Vec<(String, Destination, Vec<u8>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Intercepted {
                    module,
                    destination,
                    payload,
                } => Some((module, destination, payload)),
                TraceEvent::Lifecycle { .. } => None,
            })
            .collect()
    }

    /// Phases `module` went through, in order.
    pub fn phases(&self, module: &str) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Lifecycle { module: m, phase } if m == module => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Registry with the scripted interceptor and test proxy factories.
pub fn fixture_registry(
    trace: &Trace,
) -> (
    Arc<ModuleRegistry>,
    Arc<ScriptedInterceptorFactory>,
    Arc<TestProxyFactory>,
) {
    let interceptors = Arc::new(ScriptedInterceptorFactory::new(trace.clone()));
    let proxies = Arc::new(TestProxyFactory::new(trace.clone()));

    let registry = ModuleRegistry::new();
    registry.register_interceptor(interceptors.clone());
    registry.register_proxy(proxies.clone());
    (Arc::new(registry), interceptors, proxies)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, panicking if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("timed out")
}
