//! TLS material for the two socket legs.
//!
//! Towards the client the proxy is a TLS server presenting either the
//! configured certificate or a generated self-signed one. Towards the server
//! it is a TLS client that accepts any certificate unless verification is
//! configured, and that can present its own client certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{CertificateConfig, ServerTlsConfig};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Errors building TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("certificate verification needs a CA bundle")]
    MissingCaBundle,

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Whether a freshly read chunk starts with a TLS handshake record header.
pub fn looks_like_tls_handshake(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == TLS_HANDSHAKE && buf[1] == TLS_MAJOR_VERSION
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Acceptor for the client to proxy leg.
pub fn acceptor(certificate: Option<&CertificateConfig>) -> Result<TlsAcceptor, TlsError> {
    let (certs, key) = match certificate {
        Some(certificate) => (
            load_certs(&certificate.cert_path)?,
            load_key(&certificate.key_path)?,
        ),
        None => self_signed(vec!["localhost".to_string()])?,
    };
    Ok(TlsAcceptor::from(Arc::new(server_config(certs, key)?)))
}

/// Connector for the proxy to server leg.
pub fn connector(config: &ServerTlsConfig) -> Result<TlsConnector, TlsError> {
    Ok(TlsConnector::from(Arc::new(client_config(config)?)))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    Ok(ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

/// Client configuration for the server leg.
///
/// Trusts every server certificate unless `config.verify` is set.
pub fn client_config(config: &ServerTlsConfig) -> Result<ClientConfig, TlsError> {
    let builder =
        ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    let builder = if config.verify {
        let ca_path = config.ca_path.as_deref().ok_or(TlsError::MissingCaBundle)?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert)?;
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
    };

    match &config.certificate {
        Some(certificate) => Ok(builder.with_client_auth_cert(
            load_certs(&certificate.cert_path)?,
            load_key(&certificate.key_path)?,
        )?),
        None => Ok(builder.with_no_client_auth()),
    }
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

/// Generate a self-signed certificate for `names`.
pub fn self_signed(
    names: Vec<String>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let certified = rcgen::generate_simple_self_signed(names)?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((vec![cert], key))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| read_error(path, source))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| read_error(path, source))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_error(path, source))
}

fn read_error(path: &Path, source: std::io::Error) -> TlsError {
    TlsError::Read {
        path: path.display().to_string(),
        source,
    }
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            schemes: ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use rustls::client::ResolvesClientCert;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::client_hello(&[0x16, 0x03, 0x01, 0x02, 0x00], true)]
    #[case::bare_header(&[0x16, 0x03], true)]
    #[case::too_short(&[0x16], false)]
    #[case::empty(&[], false)]
    #[case::plaintext(b"EHLO", false)]
    #[case::alert_record(&[0x15, 0x03, 0x03], false)]
    fn test_handshake_detection(#[case] buf: &[u8], #[case] expected: bool) {
        assert_eq!(looks_like_tls_handshake(buf), expected);
    }

    #[test]
    fn test_self_signed_acceptor_and_connector_build() {
        assert!(acceptor(None).is_ok());
        assert!(connector(&ServerTlsConfig::default()).is_ok());
    }

    #[test]
    fn test_verifying_connector_needs_ca_bundle() {
        let config = ServerTlsConfig {
            verify: true,
            ..ServerTlsConfig::default()
        };
        assert!(matches!(connector(&config), Err(TlsError::MissingCaBundle)));
    }

    #[test]
    fn test_client_certificate_files_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["proxy.local".to_string()]).unwrap();
        let cert_path = dir.path().join("client.pem");
        let key_path = dir.path().join("client.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let config = ServerTlsConfig {
            certificate: Some(CertificateConfig {
                cert_path,
                key_path,
            }),
            ..ServerTlsConfig::default()
        };
        assert!(client_config(&config).unwrap().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_missing_certificate_file() {
        let certificate = CertificateConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(acceptor(Some(&certificate)), Err(TlsError::Read { .. })));
    }

    #[test]
    fn test_server_name_validation() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(matches!(server_name("not a host"), Err(TlsError::InvalidServerName(_))));
    }
}
