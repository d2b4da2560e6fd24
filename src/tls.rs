use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to decode certificate PEM: {0}")]
    CertDecode(std::io::Error),
    #[error("failed to decode private key PEM: {0}")]
    KeyDecode(std::io::Error),
    #[error("no valid certificates found")]
    NoCerts,
    #[error("no valid private key found")]
    NoKey,
    #[error("failed to build TLS config: {0}")]
    RustlsConfig(#[from] rustls::Error),
}

fn certs_from_pem(cert_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertDecode)?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }
    Ok(certs)
}

fn key_from_pem(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(TlsError::KeyDecode)?
        .ok_or(TlsError::NoKey)
}

/// Checks that `key_pem` holds a PEM private key (PKCS#1, PKCS#8 or SEC1).
pub fn check_private_key_pem(key_pem: &[u8]) -> Result<(), TlsError> {
    key_from_pem(key_pem).map(|_| ())
}

pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = certs_from_pem(cert_pem)?;
    let key = key_from_pem(key_pem)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
