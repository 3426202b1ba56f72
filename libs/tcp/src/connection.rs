//! One proxied TCP session.
//!
//! Every connection runs four tasks:
//!
//! ```text
//! client reader --> C2S chain --> queue_c2s --> server writer
//! client writer <-- queue_s2c <-- S2C chain <-- server reader
//! ```
//!
//! The first task to end arms delayed cleanup: after `close_delay` the
//! connection stops itself, which wakes the remaining tasks and removes it
//! from its proxy's manager.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn, Instrument};

use interpose_core::{
    Connection, ConnectionBase, ConnectionError, CoreError, CoreHandle, Destination, Pdu, Proxy,
    ProxyError,
};

use crate::config::{TcpConfig, TcpMode};
use crate::proxy::ProxyStats;
use crate::starttls::{C2pGate, C2pState, P2sGate, P2sState};
use crate::stream::{boxed, BoxedStream, IoStream, PrefixedStream, StreamReader, StreamWriter};
use crate::tls::{self, looks_like_tls_handshake};

/// Protocol marker of PDUs read from TCP connections.
pub const TCP_PROTOCOL: &str = "tcp";

/// Tag of the empty control PDU announcing a client-initiated TLS upgrade.
pub const STARTTLS_TAG: &str = "starttls";

/// Resolved, read-only settings shared by every connection of a proxy.
pub(crate) struct TcpSettings {
    pub config: TcpConfig,
    pub charset: &'static Encoding,
    pub acceptor: Option<TlsAcceptor>,
    pub connector: Option<TlsConnector>,
    pub server_name: Option<ServerName<'static>>,
}

impl TcpSettings {
    /// Validate `config` and load the TLS material its mode needs.
    pub fn new(config: TcpConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let charset = config.encoding()?;

        let tls_error = |e: tls::TlsError| ProxyError::Tls(e.to_string());
        let acceptor = config
            .effective_client_tls()
            .map(|client_tls| tls::acceptor(client_tls.certificate.as_ref()))
            .transpose()
            .map_err(tls_error)?;
        let connector = config
            .effective_server_tls()
            .map(|server_tls| tls::connector(&server_tls))
            .transpose()
            .map_err(tls_error)?;
        let server_name = match connector {
            Some(_) => Some(tls::server_name(config.server_name()).map_err(tls_error)?),
            None => None,
        };

        Ok(Self {
            config,
            charset,
            acceptor,
            connector,
            server_name,
        })
    }
}

type TaskExit = (&'static str, Result<(), ConnectionError>);

/// What woke the server reader.
enum ServerEvent {
    Read(usize),
    UpgradeRequested,
    Shutdown,
}

/// A client <-> proxy <-> server TCP session.
pub struct TcpConnection {
    base: ConnectionBase,
    peer: SocketAddr,
    settings: Arc<TcpSettings>,
    stats: Arc<ProxyStats>,
    /// Accepted socket, consumed by `start`.
    client: Mutex<Option<TcpStream>>,
    /// Client write half. Taken out for every write and for the upgrade, the
    /// lock is never held across an await.
    client_writer: Mutex<Option<StreamWriter>>,
    client_writer_returned: Notify,
    /// Server read half parked while the server leg is being upgraded.
    server_reader: Mutex<Option<StreamReader>>,
    c2p: C2pGate,
    p2s: P2sGate,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl TcpConnection {
    pub(crate) fn new(
        code: String,
        proxy: Weak<dyn Proxy>,
        core: CoreHandle,
        client: TcpStream,
        peer: SocketAddr,
        settings: Arc<TcpSettings>,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: ConnectionBase::new(code, Some(proxy), core),
            peer,
            settings,
            stats,
            client: Mutex::new(Some(client)),
            client_writer: Mutex::new(None),
            client_writer_returned: Notify::new(),
            server_reader: Mutex::new(None),
            c2p: C2pGate::new(),
            p2s: P2sGate::new(),
            closing: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn c2p_state(&self) -> C2pState {
        self.c2p.state()
    }

    pub fn p2s_state(&self) -> P2sState {
        self.p2s.state()
    }

    /// Every server leg state this connection went through, in order.
    pub fn p2s_history(&self) -> Vec<P2sState> {
        self.p2s.history()
    }

    fn starttls(&self) -> bool {
        self.settings.config.mode == TcpMode::Starttls
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn parked_server_reader(&self) -> MutexGuard<'_, Option<StreamReader>> {
        self.server_reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client_writer_slot(&self) -> MutexGuard<'_, Option<StreamWriter>> {
        self.client_writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the client write half is free and take it.
    ///
    /// Returns `None` once the connection stops.
    async fn take_client_writer(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<StreamWriter> {
        loop {
            let returned = self.client_writer_returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if let Some(writer) = self.client_writer_slot().take() {
                return Some(writer);
            }
            tokio::select! {
                _ = returned => {}
                _ = shutdown.wait_for(|stop| *stop) => return None,
            }
        }
    }

    fn return_client_writer(&self, writer: StreamWriter) {
        *self.client_writer_slot() = Some(writer);
        self.client_writer_returned.notify_one();
    }

    // =========================================================================
    // Setup
    // =========================================================================

    async fn connect_server(&self) -> Result<TcpStream, ConnectionError> {
        let config = &self.settings.config;
        debug!(
            host = %config.target_host,
            port = config.target_port,
            "Connecting to server"
        );

        let connect = TcpStream::connect((config.target_host.as_str(), config.target_port));
        match timeout(config.connect_timeout(), connect).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout").into()),
        }
    }

    /// Run `handshake` unless it times out or the connection stops first.
    async fn handshake<S>(
        &self,
        handshake: impl Future<Output = io::Result<S>>,
    ) -> Result<BoxedStream, ConnectionError>
    where
        S: IoStream + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let limit = self.settings.config.handshake_timeout();
        tokio::select! {
            result = timeout(limit, handshake) => match result {
                Ok(result) => result
                    .map(boxed)
                    .map_err(|e| ConnectionError::Tls(e.to_string())),
                Err(_) => Err(handshake_timeout(limit)),
            },
            _ = shutdown.wait_for(|stop| *stop) => Err(ConnectionError::Closed),
        }
    }

    /// Act as TLS server towards the client.
    async fn accept_tls<S>(&self, stream: S) -> Result<BoxedStream, ConnectionError>
    where
        S: IoStream + 'static,
    {
        let acceptor = self
            .settings
            .acceptor
            .as_ref()
            .ok_or_else(|| ConnectionError::Tls("no TLS acceptor configured".to_string()))?;
        self.handshake(acceptor.accept(stream)).await
    }

    /// Act as TLS client towards the server.
    async fn connect_tls<S>(&self, stream: S) -> Result<BoxedStream, ConnectionError>
    where
        S: IoStream + 'static,
    {
        let (Some(connector), Some(server_name)) =
            (&self.settings.connector, &self.settings.server_name)
        else {
            return Err(ConnectionError::Tls("no TLS connector configured".to_string()));
        };
        self.handshake(connector.connect(server_name.clone(), stream))
            .await
    }

    // =========================================================================
    // PDUs
    // =========================================================================

    fn pdu(
        &self,
        connection: &Arc<dyn Connection>,
        destination: Destination,
        bytes: Vec<u8>,
    ) -> Pdu {
        let size = bytes.len();
        Pdu::from_connection(connection, destination, bytes, size)
            .with_charset(self.settings.charset)
            .with_protocol(TCP_PROTOCOL)
    }

    /// Hand a PDU to the engine. Failures are logged and the loop carries on.
    async fn process(&self, pdu: Pdu) {
        let direction = pdu.destination().direction();
        match self.base.process(pdu).await {
            Ok(()) => {}
            Err(CoreError::Inactive) => debug!(direction, "Core inactive, PDU dropped"),
            Err(e) => warn!(direction, error = %e, "Failed to process PDU"),
        }
    }

    fn is_upgrade_signal(&self, pdu: &Pdu) -> bool {
        self.starttls()
            && self.p2s.state() == P2sState::PlainText
            && pdu.size() == 0
            && pdu.has_tag(STARTTLS_TAG)
    }

    // =========================================================================
    // I/O tasks
    // =========================================================================

    async fn read_from_client(
        self: Arc<Self>,
        mut reader: StreamReader,
    ) -> Result<(), ConnectionError> {
        let connection: Arc<dyn Connection> = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.settings.config.buffer_size];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read?,
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            };
            if n == 0 {
                debug!("Client closed its side");
                return Ok(());
            }

            let chunk = &buf[..n];
            if self.starttls()
                && self.c2p.state() == C2pState::PlainText
                && looks_like_tls_handshake(chunk)
            {
                reader = self.upgrade_client(&connection, reader, chunk.to_vec()).await?;
                continue;
            }

            self.stats.bytes_c2s.fetch_add(n as u64, Ordering::Relaxed);
            self.process(self.pdu(&connection, Destination::Server, chunk.to_vec()))
                .await;
        }
    }

    /// Wrap the client leg in TLS, replaying the already consumed handshake bytes.
    async fn upgrade_client(
        &self,
        connection: &Arc<dyn Connection>,
        reader: StreamReader,
        hello: Vec<u8>,
    ) -> Result<StreamReader, ConnectionError> {
        info!("Client started TLS, upgrading both legs");
        let signal = self
            .pdu(connection, Destination::Server, Vec::new())
            .with_tags([STARTTLS_TAG]);
        self.process(signal).await;

        // A pending plaintext write to a client that stopped reading must not
        // hold the upgrade forever.
        let mut shutdown = self.shutdown.subscribe();
        let limit = self.settings.config.handshake_timeout();
        let writer = match timeout(limit, self.take_client_writer(&mut shutdown)).await {
            Ok(Some(writer)) => writer,
            Ok(None) => return Err(ConnectionError::Closed),
            Err(_) => return Err(handshake_timeout(limit)),
        };

        let plain = reader.unsplit(writer);
        let stream = self.accept_tls(PrefixedStream::new(hello, plain)).await?;

        let (reader, encrypted_writer) = tokio::io::split(stream);
        self.return_client_writer(encrypted_writer);
        self.c2p.encrypt();
        debug!("Client leg encrypted");
        Ok(reader)
    }

    async fn read_from_server(
        self: Arc<Self>,
        mut reader: StreamReader,
    ) -> Result<(), ConnectionError> {
        let connection: Arc<dyn Connection> = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut requests = self.p2s.subscribe();
        let mut buf = vec![0u8; self.settings.config.buffer_size];

        loop {
            // The request may already be pending if it arrived mid-process.
            let upgrade_possible = self.starttls() && self.p2s.state() < P2sState::Transition2;
            let event = tokio::select! {
                read = reader.read(&mut buf) => ServerEvent::Read(read?),
                _ = requests.wait_for(|s| *s == P2sState::Transition1), if upgrade_possible => {
                    ServerEvent::UpgradeRequested
                }
                _ = shutdown.wait_for(|stop| *stop) => ServerEvent::Shutdown,
            };

            match event {
                ServerEvent::Read(0) => {
                    debug!("Server closed its side");
                    return Ok(());
                }
                ServerEvent::Read(n) => {
                    self.stats.bytes_s2c.fetch_add(n as u64, Ordering::Relaxed);
                    self.process(self.pdu(&connection, Destination::Client, buf[..n].to_vec()))
                        .await;
                }
                ServerEvent::UpgradeRequested => {
                    reader = self.yield_server_reader(reader, &mut shutdown).await?;
                }
                ServerEvent::Shutdown => return Ok(()),
            }
        }
    }

    /// Park the plaintext read half for the server writer and wait for the
    /// encrypted one.
    async fn yield_server_reader(
        &self,
        reader: StreamReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamReader, ConnectionError> {
        *self.parked_server_reader() = Some(reader);
        self.p2s.advance(P2sState::Transition2);

        if !self.p2s.wait_for(P2sState::Encrypted, shutdown).await {
            return Err(ConnectionError::Closed);
        }
        self.parked_server_reader()
            .take()
            .ok_or(ConnectionError::Closed)
    }

    async fn write_to_server(
        self: Arc<Self>,
        mut writer: StreamWriter,
    ) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.subscribe();

        while let Some(pdu) = self.base.queue_c2s().take().await {
            if self.is_upgrade_signal(&pdu) {
                writer = self.upgrade_server(writer, &mut shutdown).await?;
                continue;
            }
            tokio::select! {
                written = write_payload(&mut writer, pdu.payload()) => written?,
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            }
        }
        Ok(())
    }

    /// Wrap the server leg in TLS once the server reader has let go of it.
    async fn upgrade_server(
        &self,
        writer: StreamWriter,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamWriter, ConnectionError> {
        self.p2s.advance(P2sState::Transition1);
        if !self.p2s.wait_for(P2sState::Transition2, shutdown).await {
            return Err(ConnectionError::Closed);
        }

        let reader = self
            .parked_server_reader()
            .take()
            .ok_or(ConnectionError::Closed)?;
        let stream = self.connect_tls(reader.unsplit(writer)).await?;

        let (reader, writer) = tokio::io::split(stream);
        *self.parked_server_reader() = Some(reader);
        self.p2s.advance(P2sState::Encrypted);
        debug!("Server leg encrypted");
        Ok(writer)
    }

    async fn write_to_client(self: Arc<Self>) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.subscribe();

        while let Some(pdu) = self.base.queue_s2c().take().await {
            let Some(mut writer) = self.take_client_writer(&mut shutdown).await else {
                return Ok(());
            };
            tokio::select! {
                written = write_payload(&mut writer, pdu.payload()) => written?,
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            }
            self.return_client_writer(writer);
        }
        Ok(())
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Wait for the first task to end, let in-flight data drain, then stop.
    async fn supervise(self: Arc<Self>, mut tasks: JoinSet<TaskExit>) {
        match tasks.join_next().await {
            Some(Ok((task, Ok(())))) => debug!(task, "I/O task finished"),
            Some(Ok((task, Err(e)))) => debug!(task, error = %e, "I/O task failed"),
            Some(Err(e)) => warn!(error = %e, "I/O task aborted"),
            None => {}
        }

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.config.close_delay()) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
        self.stop();

        while tasks.join_next().await.is_some() {}

        let writer = self.client_writer_slot().take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.parked_server_reader().take();

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        debug!(p2s = ?self.p2s.history(), "Connection closed");
    }
}

fn handshake_timeout(limit: Duration) -> ConnectionError {
    ConnectionError::Tls(format!("TLS handshake timed out after {limit:?}"))
}

async fn write_payload(writer: &mut StreamWriter, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

fn spawn_task<F>(tasks: &mut JoinSet<TaskExit>, name: &'static str, task: F)
where
    F: Future<Output = Result<(), ConnectionError>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) }.in_current_span());
}

#[async_trait]
impl Connection for TcpConnection {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<(), ConnectionError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ConnectionError::Closed)?;
        let server = self.connect_server().await?;

        let (client, server) = match self.settings.config.mode {
            TcpMode::Starttls => (boxed(client), boxed(server)),
            TcpMode::Direct => {
                let client = match self.settings.acceptor {
                    Some(_) => self.accept_tls(client).await?,
                    None => boxed(client),
                };
                let server = match self.settings.connector {
                    Some(_) => self.connect_tls(server).await?,
                    None => boxed(server),
                };
                (client, server)
            }
        };

        let (client_reader, client_writer) = tokio::io::split(client);
        let (server_reader, server_writer) = tokio::io::split(server);
        *self.client_writer_slot() = Some(client_writer);

        let mut tasks = JoinSet::new();
        spawn_task(&mut tasks, "client reader", self.clone().read_from_client(client_reader));
        spawn_task(&mut tasks, "server reader", self.clone().read_from_server(server_reader));
        spawn_task(&mut tasks, "server writer", self.clone().write_to_server(server_writer));
        spawn_task(&mut tasks, "client writer", self.clone().write_to_client());
        tokio::spawn(self.clone().supervise(tasks).in_current_span());

        info!(
            mode = ?self.settings.config.mode,
            client_tls = self.settings.acceptor.is_some(),
            server_tls = self.settings.connector.is_some(),
            "Connection started"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(code = %self.code(), "Stopping connection");

        self.shutdown.send_replace(true);
        self.base.close_queues();
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(proxy) = self.proxy() {
            proxy.connection_manager().remove(self);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("code", &self.code())
            .field("peer", &self.peer)
            .field("c2p", &self.c2p.state())
            .field("p2s", &self.p2s.state())
            .field("closing", &self.is_closing())
            .finish()
    }
}
