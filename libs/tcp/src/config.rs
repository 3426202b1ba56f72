//! TCP proxy configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use interpose_core::ProxyError;

/// Default read buffer size per socket read.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default timeout for connecting to the target server.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Default limit for a TLS handshake, including waiting for the socket.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default time a finished connection waits for in-flight data before closing.
pub const DEFAULT_CLOSE_DELAY_MS: u64 = 500;

/// When TLS starts on the two socket legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpMode {
    /// Each leg speaks TLS from the first byte when its TLS settings are
    /// present, plain TCP otherwise.
    #[default]
    #[serde(alias = "plain")]
    Direct,
    /// Plain TCP until the client starts a TLS handshake in-band, then both
    /// legs are upgraded.
    Starttls,
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// TLS on the client to proxy leg, where the proxy is the TLS server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// Presented to clients. Falls back to a generated self-signed certificate.
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
}

/// TLS on the proxy to server leg, where the proxy is the TLS client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// Client certificate presented to the server, if it asks for one.
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,

    /// Verify the server certificate against `ca_path`. Off by default, the
    /// proxy then accepts any certificate.
    #[serde(default)]
    pub verify: bool,

    /// PEM bundle of trusted roots, required when `verify` is set.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// SNI and verified name. Defaults to `target_host`.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Settings of one TCP proxy module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address clients connect to.
    pub listen_addr: SocketAddr,

    pub target_host: String,

    pub target_port: u16,

    #[serde(default)]
    pub mode: TcpMode,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Charset label (WHATWG) attached to every PDU.
    #[serde(default = "default_charset")]
    pub charset: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,

    #[serde(default)]
    pub client_tls: Option<ClientTlsConfig>,

    #[serde(default)]
    pub server_tls: Option<ServerTlsConfig>,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_charset() -> String {
    "utf-8".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_close_delay_ms() -> u64 {
    DEFAULT_CLOSE_DELAY_MS
}

impl TcpConfig {
    pub fn new(listen_addr: SocketAddr, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listen_addr,
            target_host: target_host.into(),
            target_port,
            mode: TcpMode::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            charset: default_charset(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_delay_ms: DEFAULT_CLOSE_DELAY_MS,
            client_tls: None,
            server_tls: None,
        }
    }

    /// Check the settings that serde cannot.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.target_host.is_empty() {
            return Err(ProxyError::Config("target_host must not be empty".to_string()));
        }
        if self.target_port == 0 {
            return Err(ProxyError::Config("target_port must not be 0".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ProxyError::Config("buffer_size must be positive".to_string()));
        }
        if let Some(server_tls) = &self.server_tls {
            if server_tls.verify && server_tls.ca_path.is_none() {
                return Err(ProxyError::Config(
                    "server_tls.verify needs server_tls.ca_path".to_string(),
                ));
            }
        }
        self.encoding()?;
        Ok(())
    }

    pub fn encoding(&self) -> Result<&'static Encoding, ProxyError> {
        Encoding::for_label(self.charset.as_bytes())
            .ok_or_else(|| ProxyError::Config(format!("unknown charset '{}'", self.charset)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    /// TLS settings of the client leg, if it uses TLS at all.
    ///
    /// STARTTLS always upgrades both legs, so defaults fill in there.
    pub fn effective_client_tls(&self) -> Option<ClientTlsConfig> {
        match (&self.client_tls, self.mode) {
            (Some(tls), _) => Some(tls.clone()),
            (None, TcpMode::Starttls) => Some(ClientTlsConfig::default()),
            (None, TcpMode::Direct) => None,
        }
    }

    /// TLS settings of the server leg, if it uses TLS at all.
    pub fn effective_server_tls(&self) -> Option<ServerTlsConfig> {
        match (&self.server_tls, self.mode) {
            (Some(tls), _) => Some(tls.clone()),
            (None, TcpMode::Starttls) => Some(ServerTlsConfig::default()),
            (None, TcpMode::Direct) => None,
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_tls
            .as_ref()
            .and_then(|tls| tls.server_name.as_deref())
            .unwrap_or(&self.target_host)
    }
}
