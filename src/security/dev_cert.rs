//! Self-signed certificate generation for local development.
//!
//! Never invoked by the gateway itself — wired up only by the
//! `gen-dev-cert` binary. Production deployments bring their own
//! certificate from a real CA.

use crate::error::{MailError, Result};
use rcgen::{CertificateParams, DistinguishedName, SanType};
use tracing::info;

pub fn generate_self_signed_cert(domain: &str, cert_output: &str, key_output: &str) -> Result<()> {
    info!("generating self-signed certificate for {}", domain);

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        SanType::DnsName(domain.to_string()),
        SanType::DnsName(format!("*.{}", domain)),
        SanType::DnsName("localhost".to_string()),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("failed to generate certificate: {}", e)))?;

    std::fs::write(
        cert_output,
        cert.serialize_pem()
            .map_err(|e| MailError::Tls(format!("failed to serialize certificate: {}", e)))?,
    )
    .map_err(|e| MailError::Tls(format!("failed to write certificate: {}", e)))?;

    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| MailError::Tls(format!("failed to write private key: {}", e)))?;

    info!("wrote {} and {}", cert_output, key_output);
    Ok(())
}
