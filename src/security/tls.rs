//! STARTTLS support for the SMTP listener.
//!
//! Certificates are loaded once at startup from PEM files named in
//! [`crate::config::Config`]; there is no hot-reload. Cipher suites are
//! pinned to ECDHE key exchange with an AEAD cipher, matching the set an
//! operator would configure on a modern MTA (no CBC, no static RSA KEX).

use crate::error::{MailError, Result};
use rustls::cipher_suite::{
    TLS13_AES_128_GCM_SHA256, TLS13_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A loaded certificate chain and key, ready to hand out `TlsAcceptor`s.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Loads a certificate chain and PKCS#8 private key from PEM files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("failed to open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(MailError::Tls("no certificates found in file".to_string()));
        }
        debug!("loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("failed to open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);

        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("failed to read private keys: {}", e)))?;

        if keys.is_empty() {
            return Err(MailError::Tls("no private key found in file".to_string()));
        }
        let private_key = keys.remove(0);

        let config = ServerConfig::builder()
            .with_cipher_suites(&[
                TLS13_AES_128_GCM_SHA256,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ])
            .with_safe_default_kx_groups()
            .with_safe_default_protocol_versions()
            .map_err(|e| MailError::Tls(format!("failed to build TLS config: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| MailError::Tls(format!("failed to build TLS config: {}", e)))?;

        info!("TLS configuration ready");

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Builds a `TlsAcceptor` for use during a STARTTLS upgrade.
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::dev_cert::generate_self_signed_cert;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_a_freshly_generated_cert() {
        let cert_file = NamedTempFile::new().unwrap();
        let key_file = NamedTempFile::new().unwrap();

        generate_self_signed_cert(
            "test.local",
            cert_file.path().to_str().unwrap(),
            key_file.path().to_str().unwrap(),
        )
        .unwrap();

        let tls_config = TlsConfig::from_pem_files(cert_file.path(), key_file.path()).unwrap();
        assert!(Arc::strong_count(&tls_config.server_config) >= 1);
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let key_file = NamedTempFile::new().unwrap();
        let result = TlsConfig::from_pem_files(Path::new("/nonexistent/cert.pem"), key_file.path());
        assert!(result.is_err());
    }
}
