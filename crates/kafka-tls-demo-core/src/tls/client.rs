//! TLS client connector for broker connections.
//!
//! Builds the security context the demos present to the broker: the
//! client certificate and key as identity, the CA file as the only trusted
//! root, and optionally the insecure verifier.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::{debug, warn};

use crate::config::BrokerTlsConfig;
use crate::error::{TlsError, TlsResult};

use super::verifier::NoServerVerification;

/// Install the ring crypto provider if not already installed.
pub(crate) fn ensure_crypto_provider() {
    // Fails only when a provider is already installed.
    let _ = CryptoProvider::install_default(default_provider());
}

/// TLS connector for outbound connections to Kafka brokers.
///
/// Cheap to clone; every clone shares the same immutable rustls config.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

/// Build a TLS connector from the certificate, key and CA files.
///
/// Each call reads the files again and returns an independent context.
///
/// # Errors
///
/// Returns an error if any of the three files is missing or empty, or if
/// their contents cannot be turned into a client configuration.
pub fn build_tls_connector(config: &BrokerTlsConfig) -> TlsResult<TlsConnector> {
    TlsConnector::new(config)
}

impl TlsConnector {
    /// Create a new TLS connector from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A certificate, key or CA file is missing or zero bytes long
    /// - Certificate files cannot be loaded
    /// - Private key files cannot be loaded
    /// - TLS configuration is invalid
    pub fn new(config: &BrokerTlsConfig) -> TlsResult<Self> {
        check_file(&config.cert_path)?;
        check_file(&config.key_path)?;
        check_file(&config.ca_cert_path)?;

        ensure_crypto_provider();
        let client_config = build_client_config(config)?;
        Ok(Self {
            inner: TokioTlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Connect to a server over TLS.
    ///
    /// `server_name` is used for SNI and, unless verification is skipped,
    /// for hostname verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> TlsResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name: {e}")))?;

        debug!("initiating TLS handshake");

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// Fail early when a file does not exist or was left empty.
///
/// The demos ship placeholder certificate files, so an empty one almost
/// always means the operator forgot to drop in their own.
///
/// # Errors
///
/// Returns [`TlsError::CertificateFileMissing`] if the file cannot be
/// accessed and [`TlsError::EmptyCertificateFile`] if it has zero bytes.
pub fn check_file(path: &Path) -> TlsResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| TlsError::CertificateFileMissing {
        path: path.display().to_string(),
        source: e,
    })?;

    if metadata.len() == 0 {
        return Err(TlsError::EmptyCertificateFile(path.display().to_string()));
    }

    Ok(())
}

/// Build a rustls `ClientConfig` from our configuration.
fn build_client_config(config: &BrokerTlsConfig) -> TlsResult<ClientConfig> {
    let certs = load_certificates(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let root_store = build_root_store(&config.ca_cert_path)?;

    let builder = if config.insecure_skip_verify {
        warn!("broker certificate verification is disabled (INSECURE)");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification::new()))
    } else {
        ClientConfig::builder().with_root_certificates(root_store)
    };

    debug!("loading client certificate for mTLS");
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))
}

/// Build the root certificate store from the CA file.
fn build_root_store(ca_path: &Path) -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    debug!(path = %ca_path.display(), "loading CA certificate");
    let certs = load_certificates(ca_path)?;
    let (added, ignored) = root_store.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(ignored, path = %ca_path.display(), "skipped unparseable CA certificates");
    }
    debug!(added, "added CA certificates to trust store");

    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }

    Ok(root_store)
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                debug!(path = %path.display(), "loaded PKCS#1 RSA private key");
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                debug!(path = %path.display(), "loaded PKCS#8 private key");
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                debug!(path = %path.display(), "loaded SEC1 EC private key");
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(TlsError::PrivateKeyLoad {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(TlsError::NoPrivateKeys(path.display().to_string()))
}
