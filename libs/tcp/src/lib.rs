//! TCP transport for the interpose engine.
//!
//! A [`TcpProxy`] listens on one address and relays every accepted client to
//! a fixed target server. Bytes read from either side become PDUs that pass
//! through the engine's interceptor chains before they are written to the
//! other side.
//!
//! Two modes are supported (see [`TcpMode`]):
//!
//! - direct: each leg is plain TCP or TLS from the first byte, set up on its
//!   own. [`ClientTlsConfig`] makes the proxy a TLS server towards the
//!   client, [`ServerTlsConfig`] makes it a TLS client towards the server
//!   and may carry a client certificate to present upstream.
//! - STARTTLS: plain TCP until the client starts a TLS handshake in-band,
//!   at which point both legs are upgraded (see [`starttls`]).

pub mod config;
pub mod connection;
pub mod proxy;
pub mod starttls;
pub mod stream;
pub mod tls;

pub use config::{CertificateConfig, ClientTlsConfig, ServerTlsConfig, TcpConfig, TcpMode};
pub use connection::{TcpConnection, STARTTLS_TAG, TCP_PROTOCOL};
pub use proxy::{ProxyStats, TcpProxy, TcpProxyFactory, TCP_PROXY};
pub use starttls::{C2pState, P2sState};
pub use tls::TlsError;
