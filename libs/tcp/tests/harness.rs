//! Test harness for TCP proxy integration tests.
//!
//! Provides plain, TLS, mutual TLS and STARTTLS echo servers, a throwaway
//! PKI, a TLS client helper and a core running one TCP proxy in front of a
//! backend.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use interpose_core::{Core, CoreModules, CoreState, ModuleSpec};
use interpose_tcp::{
    tls, CertificateConfig, ServerTlsConfig, TcpConfig, TcpMode, TcpProxy, TcpProxyFactory,
};
use interpose_testing::{fixture_registry, init_tracing, within, Trace};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Command a STARTTLS client sends before its handshake.
pub const STARTTLS_COMMAND: &[u8] = b"STARTTLS\r\n";

/// Reply of the STARTTLS backend to [`STARTTLS_COMMAND`].
pub const STARTTLS_REPLY: &[u8] = b"OK\r\n";

/// Bytes the flooding backend writes before it switches to TLS.
pub const FLOOD_BYTES: usize = 32 * 1024 * 1024;

/// How a backend treats accepted sockets.
#[derive(Clone, Copy)]
enum BackendKind {
    Plain,
    Tls,
    Starttls,
    /// Writes [`FLOOD_BYTES`] of plaintext, then speaks TLS.
    FloodThenTls,
}

/// Throwaway CA with a server leaf for `localhost` and a client leaf.
///
/// The CA bundle and the client certificate live as PEM files in a temporary
/// directory so proxy configs can point at them.
pub struct TestPki {
    _dir: TempDir,
    pub ca_path: PathBuf,
    pub client: CertificateConfig,
    ca_der: CertificateDer<'static>,
    server_cert: CertificateDer<'static>,
    server_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> io::Result<Self> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(io::Error::other)?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let ca_key = KeyPair::generate().map_err(io::Error::other)?;
        let ca_cert = ca_params.self_signed(&ca_key).map_err(io::Error::other)?;

        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string()]).map_err(io::Error::other)?;
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().map_err(io::Error::other)?;
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .map_err(io::Error::other)?;

        let mut client_params =
            CertificateParams::new(vec!["proxy.local".to_string()]).map_err(io::Error::other)?;
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate().map_err(io::Error::other)?;
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .map_err(io::Error::other)?;

        let dir = tempfile::tempdir()?;
        let ca_path = dir.path().join("ca.pem");
        let client = CertificateConfig {
            cert_path: dir.path().join("client.pem"),
            key_path: dir.path().join("client.key"),
        };
        std::fs::write(&ca_path, ca_cert.pem())?;
        std::fs::write(&client.cert_path, client_cert.pem())?;
        std::fs::write(&client.key_path, client_key.serialize_pem())?;

        Ok(Self {
            _dir: dir,
            ca_path,
            client,
            ca_der: CertificateDer::from(ca_cert.der().to_vec()),
            server_cert: CertificateDer::from(server_cert.der().to_vec()),
            server_key: server_key.serialize_der(),
        })
    }

    /// Proxy side settings that verify the server and present the client leaf.
    pub fn server_tls(&self) -> ServerTlsConfig {
        ServerTlsConfig {
            certificate: Some(self.client.clone()),
            verify: true,
            ca_path: Some(self.ca_path.clone()),
            server_name: Some("localhost".to_string()),
        }
    }

    /// Backend acceptor presenting the server leaf and requiring a client
    /// certificate signed by this CA.
    fn mutual_acceptor(&self) -> io::Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).map_err(io::Error::other)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(io::Error::other)?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()));
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(io::Error::other)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.server_cert.clone()], key)
            .map_err(io::Error::other)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Echo server counting the bytes it receives.
#[allow(dead_code)]
pub struct EchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_kind(BackendKind::Plain).await
    }

    /// Echo server speaking TLS from the first byte.
    pub async fn spawn_tls() -> io::Result<Self> {
        Self::spawn_kind(BackendKind::Tls).await
    }

    /// Plaintext server that answers [`STARTTLS_COMMAND`] with
    /// [`STARTTLS_REPLY`], then switches to TLS and echoes.
    pub async fn spawn_starttls() -> io::Result<Self> {
        Self::spawn_kind(BackendKind::Starttls).await
    }

    /// Echo server that only completes TLS for clients presenting a
    /// certificate signed by `pki`.
    pub async fn spawn_mutual_tls(pki: &TestPki) -> io::Result<Self> {
        Self::spawn_with(BackendKind::Tls, pki.mutual_acceptor()?).await
    }

    /// Server that writes [`FLOOD_BYTES`] unprompted, then switches to TLS.
    pub async fn spawn_flood_then_tls() -> io::Result<Self> {
        Self::spawn_kind(BackendKind::FloodThenTls).await
    }

    async fn spawn_kind(kind: BackendKind) -> io::Result<Self> {
        Self::spawn_with(kind, test_acceptor()?).await
    }

    async fn spawn_with(kind: BackendKind, acceptor: TlsAcceptor) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    let _ = serve(kind, stream, acceptor, bytes).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(
    kind: BackendKind,
    mut stream: TcpStream,
    acceptor: TlsAcceptor,
    bytes: Arc<AtomicU64>,
) -> io::Result<()> {
    match kind {
        BackendKind::Plain => echo(stream, bytes).await,
        BackendKind::Tls => echo(acceptor.accept(stream).await?, bytes).await,
        BackendKind::Starttls => {
            let mut command = vec![0u8; STARTTLS_COMMAND.len()];
            stream.read_exact(&mut command).await?;
            bytes.fetch_add(command.len() as u64, Ordering::Relaxed);
            if command != STARTTLS_COMMAND {
                return Err(io::Error::other("unexpected command"));
            }
            stream.write_all(STARTTLS_REPLY).await?;
            echo(acceptor.accept(stream).await?, bytes).await
        }
        BackendKind::FloodThenTls => {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..FLOOD_BYTES / chunk.len() {
                stream.write_all(&chunk).await?;
            }
            echo(acceptor.accept(stream).await?, bytes).await
        }
    }
}

async fn echo<S>(mut stream: S, bytes: Arc<AtomicU64>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        bytes.fetch_add(n as u64, Ordering::Relaxed);
        stream.write_all(&buf[..n]).await?;
        stream.flush().await?;
    }
}

fn test_acceptor() -> io::Result<TlsAcceptor> {
    let (certs, key) = tls::self_signed(vec!["localhost".to_string()]).map_err(io::Error::other)?;
    let config = tls::server_config(certs, key).map_err(io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Run a TLS client handshake over `stream`, trusting any certificate.
pub async fn tls_connect(stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
    let config = tls::client_config(&ServerTlsConfig::default()).map_err(io::Error::other)?;
    let server_name = tls::server_name("localhost").map_err(io::Error::other)?;
    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
}

/// Write `payload` and read back exactly as many bytes.
pub async fn roundtrip<S>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    stream.flush().await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn tcp_config(target: SocketAddr, mode: TcpMode) -> TcpConfig {
    let mut config = TcpConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        target.ip().to_string(),
        target.port(),
    );
    config.mode = mode;
    config.close_delay_ms = 50;
    config.connect_timeout_ms = 500;
    config.handshake_timeout_ms = 500;
    config
}

/// A started core with one TCP proxy named `"tcp-proxy"`.
pub struct ProxyHandle {
    pub core: Core,
    pub proxy: Arc<TcpProxy>,
    pub addr: SocketAddr,
}

impl ProxyHandle {
    pub async fn start(
        trace: &Trace,
        config: TcpConfig,
        c2s: Vec<ModuleSpec>,
        s2c: Vec<ModuleSpec>,
    ) -> Self {
        init_tracing();
        let (registry, _, _) = fixture_registry(trace);
        let factory = Arc::new(TcpProxyFactory::new());
        registry.register_proxy(factory.clone());

        let core = Core::new(
            registry,
            CoreModules {
                proxies: vec![TcpProxyFactory::module("tcp-proxy", &config).unwrap()],
                interceptors_c2s: c2s,
                interceptors_s2c: s2c,
            },
        );
        assert!(core.start());
        within(TIMEOUT, core.wait_for_state(CoreState::Started)).await;

        let proxy = factory.proxy("tcp-proxy").expect("proxy built");
        let addr = proxy.local_addr().expect("proxy listening");
        Self { core, proxy, addr }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    pub async fn stop(self) {
        self.core.stop();
        within(TIMEOUT, self.core.wait_for_state(CoreState::Stopped)).await;
    }
}
