//! TLS support for the upgrade listener and outbound HTTPS
//!
//! The TLS upgrade listener terminates client sessions with a locally
//! configured certificate; outbound HTTPS to origin servers validates
//! against the bundled webpki root set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{CarouselError, Result};

/// Client configuration shared by every outbound HTTPS connection
static CLIENT_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
});

/// Load the certificate chain and private key for the TLS upgrade listener
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_file = File::open(cert_path).map_err(|e| {
        CarouselError::Tls(format!(
            "failed to open certificate {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            CarouselError::Tls(format!(
                "invalid certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;

    let key_file = File::open(key_path).map_err(|e| {
        CarouselError::Tls(format!(
            "failed to open private key {}: {}",
            key_path.display(),
            e
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| {
            CarouselError::Tls(format!(
                "invalid private key {}: {}",
                key_path.display(),
                e
            ))
        })?
        .ok_or_else(|| {
            CarouselError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CarouselError::Tls(format!("invalid certificate/key pair: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Wrap an established stream in a client TLS session for `host`
pub async fn wrap_client(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CarouselError::Tls(format!("invalid server name {}: {}", host, e)))?;
    let connector = TlsConnector::from(CLIENT_CONFIG.clone());
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| CarouselError::Tls(format!("TLS handshake with {} failed: {}", host, e)))
}
