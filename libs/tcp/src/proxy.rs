//! TCP proxy: listens for clients and opens one [`TcpConnection`] per accept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use interpose_core::{
    Connection, ConnectionManager, CoreHandle, ModuleSpec, Pdu, Proxy, ProxyError, ProxyFactory,
};

use crate::config::TcpConfig;
use crate::connection::{TcpConnection, TcpSettings, TCP_PROTOCOL};

/// Registry code of [`TcpProxyFactory`].
pub const TCP_PROXY: &str = "tcp";

/// Pause after a failed accept so persistent errors do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters of one proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently running.
    pub connections_active: AtomicU64,
    /// Connections that ran and closed.
    pub connections_closed: AtomicU64,
    /// Connections that could not reach the server or finish the handshake.
    pub connections_failed: AtomicU64,
    /// Bytes read from clients.
    pub bytes_c2s: AtomicU64,
    /// Bytes read from servers.
    pub bytes_s2c: AtomicU64,
}

impl ProxyStats {
    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.connections_failed.load(Ordering::Relaxed)
    }
}

/// Proxy between TCP clients and one target server.
pub struct TcpProxy {
    code: String,
    config: TcpConfig,
    core: CoreHandle,
    connections: ConnectionManager,
    settings: OnceLock<Arc<TcpSettings>>,
    local_addr: OnceLock<SocketAddr>,
    stats: Arc<ProxyStats>,
    shutdown: watch::Sender<bool>,
    this: Weak<TcpProxy>,
}

impl TcpProxy {
    pub fn new(code: impl Into<String>, config: TcpConfig, core: CoreHandle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            code: code.into(),
            config,
            connections: ConnectionManager::new(&core),
            core,
            settings: OnceLock::new(),
            local_addr: OnceLock::new(),
            stats: Arc::new(ProxyStats::default()),
            shutdown: watch::channel(false).0,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        settings: Arc<TcpSettings>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.open_connection(stream, peer, &settings),
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("Accept loop finished");
    }

    fn open_connection(&self, stream: TcpStream, peer: SocketAddr, settings: &Arc<TcpSettings>) {
        let code = self.connections.next_code();
        let proxy: Weak<dyn Proxy> = self.this.clone();
        let connection = TcpConnection::new(
            code.clone(),
            proxy,
            self.core.clone(),
            stream,
            peer,
            Arc::clone(settings),
            Arc::clone(&self.stats),
        );

        // Registered before the shutdown check, so a concurrent stop() either
        // sees it in the manager or we see the flag.
        self.connections.add(connection.clone());
        if *self.shutdown.borrow() {
            debug!(code = %code, peer = %peer, "Proxy stopped, dropping connection");
            connection.stop();
            return;
        }

        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(code = %code, peer = %peer, "Connection accepted");

        let stats = Arc::clone(&self.stats);
        tokio::spawn(
            async move {
                if let Err(e) = connection.clone().start().await {
                    warn!(error = %e, "Connection failed to start");
                    stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    connection.stop();
                }
            }
            .instrument(info_span!("connection", code = %code, peer = %peer)),
        );
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn code(&self) -> &str {
        &self.code
    }

    async fn prepare(&self) -> Result<(), ProxyError> {
        if self.settings.get().is_none() {
            let settings = TcpSettings::new(self.config.clone())?;
            let _ = self.settings.set(Arc::new(settings));
        }
        debug!(
            proxy = %self.code,
            mode = ?self.config.mode,
            target = %format!("{}:{}", self.config.target_host, self.config.target_port),
            "Proxy prepared"
        );
        Ok(())
    }

    async fn start(&self) -> Result<(), ProxyError> {
        let settings = self
            .settings
            .get()
            .cloned()
            .ok_or_else(|| ProxyError::NotPrepared(self.code.clone()))?;
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| ProxyError::NotPrepared(self.code.clone()))?;

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        info!(
            proxy = %self.code,
            bind_addr = %local_addr,
            target_host = %self.config.target_host,
            target_port = self.config.target_port,
            mode = ?self.config.mode,
            "Proxy listening"
        );

        tokio::spawn(
            this.accept_loop(listener, settings, self.shutdown.subscribe())
                .instrument(info_span!("proxy", code = %self.code)),
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.shutdown.send_replace(true);
        self.connections.stop();
        info!(proxy = %self.code, "Proxy stopped");
        Ok(())
    }

    fn supports(&self, pdu: &Pdu) -> bool {
        pdu.protocol() == TCP_PROTOCOL
    }

    fn connection_manager(&self) -> &ConnectionManager {
        &self.connections
    }
}

/// Builds [`TcpProxy`]s from module settings.
#[derive(Default)]
pub struct TcpProxyFactory {
    created: Mutex<HashMap<String, Weak<TcpProxy>>>,
}

impl TcpProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live proxy created for `module`, if any.
    pub fn proxy(&self, module: &str) -> Option<Arc<TcpProxy>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .and_then(Weak::upgrade)
    }

    /// Module description running a TCP proxy with `config`.
    pub fn module(code: &str, config: &TcpConfig) -> Result<ModuleSpec, ProxyError> {
        let config = serde_json::to_value(config)?;
        Ok(ModuleSpec::new(code, TCP_PROXY).with_config(config))
    }
}

impl ProxyFactory for TcpProxyFactory {
    fn code(&self) -> &str {
        TCP_PROXY
    }

    fn create_proxy(
        &self,
        module: &ModuleSpec,
        core: CoreHandle,
    ) -> Result<Arc<dyn Proxy>, ProxyError> {
        let config: TcpConfig = module.parse_config()?;
        let proxy = TcpProxy::new(module.code.clone(), config, core);

        let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
        created.retain(|_, proxy| proxy.strong_count() > 0);
        created.insert(module.code.clone(), Arc::downgrade(&proxy));
        Ok(proxy)
    }
}
