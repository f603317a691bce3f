//! Client TLS configuration
//!
//! Loads the CA certificate, client certificate chain and private key from
//! PEM files and builds a rustls client config for mutually authenticated
//! broker connections. Everything here runs once at startup; a failure is a
//! configuration error, never retried.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::EndpointTlsConfig;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io { path: String, source: std::io::Error },
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io { path, source } => write!(f, "cannot read {}: {}", path, source),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TlsError::CertificateError(format!("Failed to parse certificates in {}: {}", path, e))
        })?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_reader(open(path)?).map_err(|e| {
        TlsError::PrivateKeyError(format!("Failed to parse private key in {}: {}", path, e))
    })
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();

    for cert in load_certs(path)? {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(root_store)
}

/// Build a client config that verifies the broker against the configured CA
/// and presents the configured client certificate.
pub fn load_client_config(config: &EndpointTlsConfig) -> Result<Arc<ClientConfig>, TlsError> {
    let (ca_path, cert_path, key_path) = config.paths().ok_or_else(|| {
        TlsError::ConfigError("ca_cert, client_cert and client_key are all required".to_string())
    })?;

    let root_store = load_ca_certs(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?;

    Ok(Arc::new(client_config))
}

/// Parse the name the broker's certificate must carry
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TlsError::ConfigError(format!("Invalid server name '{}': {}", name, e)))
}
