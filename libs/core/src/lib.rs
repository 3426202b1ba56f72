//! Traffic-routing engine of the interpose intercepting proxy.
//!
//! Traffic between a client and a server is cut into [`Pdu`]s that flow
//! through an ordered chain of [`Interceptor`]s, one chain per direction:
//!
//! ```text
//! client --read--> C2S chain --> queue_c2s --write--> server
//! client <--write-- queue_s2c <-- S2C chain <--read-- server
//! ```
//!
//! The [`Core`] owns the lifecycle of proxies and interceptor chains;
//! transports implement [`Proxy`] and [`Connection`] and reach the engine
//! through a [`CoreHandle`].

pub mod connection;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod listener;
pub mod module;
pub mod pdu;
pub mod proxy;
pub mod queue;

pub use connection::{Connection, ConnectionBase, ConnectionManager};
pub use engine::{Core, CoreHandle, CoreState};
pub use error::{ConnectionError, CoreError, InterceptorError, ProxyError};
pub use interceptor::{
    ChainOutcome, Interceptor, InterceptorExecutor, InterceptorFactory, InterceptorManager,
    PduSender, Verdict,
};
pub use listener::{ConnectionListener, CoreListener, ListenerRegistry};
pub use module::{CoreModules, ModuleRegistry, ModuleSpec};
pub use pdu::{Destination, Pdu, GENERIC_PROTOCOL};
pub use proxy::{Proxy, ProxyExecutor, ProxyFactory, ProxyManager};
pub use queue::PduQueue;
