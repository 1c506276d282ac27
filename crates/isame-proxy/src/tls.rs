//! TLS setup for the HTTPS front door.
//!
//! Loads the PEM certificate chain and private key, applies the
//! configured minimum protocol version and optional cipher-suite
//! restriction, and produces the acceptor the listener uses. All of
//! this runs at startup; a bad certificate aborts before any port is
//! bound.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::ring::cipher_suite;
use rustls::{ServerConfig, SupportedCipherSuite};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use isame_common::{LbError, Result, TlsConfig};

/// Build the acceptor for the HTTPS listener.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(load_server_config(config)?))
}

/// Load and validate the full TLS server configuration.
pub fn load_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_key(&config.key_file)?;

    let provider = build_provider(&config.cipher_suites)?;
    let versions: &[&rustls::SupportedProtocolVersion] = match config.min_version.as_str() {
        "1.3" => &[&rustls::version::TLS13],
        // default, and explicit "1.2"
        _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
    };

    let mut server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|e| LbError::Tls(format!("protocol version selection failed: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| LbError::Tls(format!("certificate validation failed: {}", e)))?;

    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(server_config))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| LbError::Tls(format!("failed to open cert_file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| LbError::Tls(format!("failed to parse cert_file {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(LbError::Tls(format!("no certificates found in {}", path)));
    }

    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| LbError::Tls(format!("failed to open key_file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| LbError::Tls(format!("failed to parse key_file {}: {}", path, e)))?
        .ok_or_else(|| LbError::Tls(format!("no private key found in {}", path)))
}

/// Restrict the ring provider to the named cipher suites, or keep its
/// defaults when no restriction is configured.
fn build_provider(names: &[String]) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();

    if !names.is_empty() {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let suite = suite_by_name(name)
                .ok_or_else(|| LbError::Tls(format!("unknown cipher suite: {}", name)))?;
            selected.push(suite);
        }
        provider.cipher_suites = selected;
    }

    Ok(provider)
}

fn suite_by_name(name: &str) -> Option<SupportedCipherSuite> {
    match name {
        "TLS13_AES_128_GCM_SHA256" => Some(cipher_suite::TLS13_AES_128_GCM_SHA256),
        "TLS13_AES_256_GCM_SHA384" => Some(cipher_suite::TLS13_AES_256_GCM_SHA384),
        "TLS13_CHACHA20_POLY1305_SHA256" => Some(cipher_suite::TLS13_CHACHA20_POLY1305_SHA256),
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256" => {
            Some(cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256)
        }
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384" => {
            Some(cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384)
        }
        "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256" => {
            Some(cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256)
        }
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256" => {
            Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256)
        }
        "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384" => {
            Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384)
        }
        "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256" => {
            Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256)
        }
        _ => None,
    }
}
