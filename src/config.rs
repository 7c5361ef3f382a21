use crate::error::{MailError, Result};
use serde::Deserialize;

/// Process-wide configuration, read once at startup from the environment.
///
/// Every field has a default, so the gateway starts cleanly with nothing
/// set beyond the two upstream URLs; anything else is layered on top via
/// `GATEWAY_*` environment variables (see the `config` crate docs for the
/// `Environment` source's list-vs-scalar rules).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the SMTP listener binds to, e.g. `0.0.0.0:2525`.
    pub smtp_bind_addr: String,

    /// Hostname advertised in the greeting banner and EHLO response.
    pub smtp_hostname: String,

    /// Path to a PEM-encoded certificate chain for STARTTLS. When either
    /// this or `tls_key_path` is unset, STARTTLS is not advertised.
    pub tls_cert_path: Option<String>,

    /// Path to the PEM-encoded private key matching `tls_cert_path`.
    pub tls_key_path: Option<String>,

    /// Base URL of the credential validation API (no trailing slash).
    pub auth_api_url: String,

    /// Base URL of the email submission API (no trailing slash).
    pub email_api_url: String,

    /// Maximum accepted `DATA` payload size in bytes, post dot-unstuffing.
    pub max_message_size: usize,

    /// Maximum `RCPT TO` commands accepted in a single transaction.
    pub max_recipients: usize,

    /// Hard cap on concurrently open connections for this process.
    pub max_connections: usize,

    /// Seconds a connection may sit idle between commands before the
    /// server drops it with `421`.
    pub command_timeout_secs: u64,

    /// Seconds allowed for a single `DATA` transfer.
    pub data_timeout_secs: u64,

    /// Per-attempt timeout, in seconds, for calls to the auth API.
    pub auth_api_timeout_secs: u64,

    /// Per-attempt timeout, in seconds, for calls to the email API.
    pub email_api_timeout_secs: u64,

    /// Extra attempts (beyond the first) for a transient auth API failure.
    pub auth_api_retries: u32,

    /// Extra attempts (beyond the first) for a transient submission failure.
    pub email_api_retries: u32,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `smtp_gateway=debug`.
    pub log_level: String,

    /// `"pretty"` or `"json"`.
    pub log_format: String,
}

impl Config {
    /// Builds configuration from the process environment, prefixed with
    /// `GATEWAY_` (e.g. `GATEWAY_SMTP_BIND_ADDR`), layered over defaults.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("smtp_bind_addr", "0.0.0.0:2525")?
            .set_default("smtp_hostname", default_hostname())?
            .set_default("tls_cert_path", None::<String>)?
            .set_default("tls_key_path", None::<String>)?
            .set_default("max_message_size", 25 * 1024 * 1024i64)?
            .set_default("max_recipients", 100i64)?
            .set_default("max_connections", 500i64)?
            .set_default("command_timeout_secs", 300i64)?
            .set_default("data_timeout_secs", 600i64)?
            .set_default("auth_api_timeout_secs", 5i64)?
            .set_default("email_api_timeout_secs", 10i64)?
            .set_default("auth_api_retries", 2i64)?
            .set_default("email_api_retries", 1i64)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .try_parsing(true)
                    .separator("_"),
            );

        let raw = builder.build().map_err(|e| MailError::Config(e.to_string()))?;
        let cfg: Config = raw.try_deserialize().map_err(|e| MailError::Config(e.to_string()))?;

        if cfg.auth_api_url.is_empty() {
            return Err(MailError::Config(
                "GATEWAY_AUTH_API_URL must be set".to_string(),
            ));
        }
        if cfg.email_api_url.is_empty() {
            return Err(MailError::Config(
                "GATEWAY_EMAIL_API_URL must be set".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// `true` once both cert and key paths are configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

fn default_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "localhost".to_string())
}
