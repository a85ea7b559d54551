//! TLS material loading for the control listener, the HTTPS public
//! listener and the client side of the control connection

use crate::error::{Result, TunnelError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        TunnelError::tls(format!(
            "Failed to open {what} file '{}': {e}",
            path.display()
        ))
    })?;
    Ok(BufReader::new(file))
}

/// Load certificates from a PEM file
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            TunnelError::tls(format!(
                "Failed to parse certificates from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(TunnelError::tls(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    debug!(count = certs.len(), path = %path.display(), "Loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path, "private key")?;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            // certificates bundled in the same file
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(TunnelError::tls(format!(
                    "No private key found in '{}'",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(TunnelError::tls(format!(
                    "Failed to parse private key from '{}': {e}",
                    path.display()
                )));
            }
        }
    }
}

/// Build a server-side acceptor from a PEM certificate chain and key
///
/// # Errors
///
/// Returns an error if the material cannot be loaded or does not match.
pub fn acceptor_from_files(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TunnelError::tls(format!("Unsupported TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::tls(format!("Failed to create TLS config: {e}")))?;

    info!(cert_path = %cert_path.display(), "Created TLS acceptor");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side connector trusting the CA certificates in `ca_path`
///
/// # Errors
///
/// Returns an error if the CA bundle cannot be loaded.
pub fn connector_from_ca(ca_path: &Path) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TunnelError::tls(format!("Invalid CA certificate: {e}")))?;
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TunnelError::tls(format!("Unsupported TLS versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    debug!(ca_path = %ca_path.display(), "Created TLS connector");
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the name the server certificate must be valid for
///
/// # Errors
///
/// Returns an error if `name` is neither a DNS name nor an IP address.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TunnelError::tls(format!("Invalid TLS server name '{name}': {e}")))
}
