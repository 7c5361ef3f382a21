use thiserror::Error;

/// The fixed, finite error taxonomy that crosses a component boundary.
///
/// Every variant maps to exactly one SMTP reply class in
/// [`crate::smtp::reply`]; downstream code should never need to inspect
/// anything other than the variant tag.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    /// Bad MIME (§4.3): missing `From`, no recipients, or undecodable bytes.
    #[error("message rejected: {0}")]
    Format(String),

    /// Bad credentials, as reported by the Auth API (401/403).
    #[error("authentication failed")]
    Authentication,

    /// Upstream rejected the message, or every recipient failed (§4.4).
    #[error("{0}")]
    Validation(String),

    /// Upstream returned 429 for some recipient.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Upstream 5xx after exhausting retries.
    #[error("upstream server error: {0}")]
    Server(String),

    /// Transport/timeout error after exhausting retries.
    #[error("network error: {0}")]
    Network(String),

    /// Message body exceeded the configured size cap.
    #[error("message too large (max {max} bytes)")]
    MessageTooLarge { max: usize },

    /// Command issued out of order or with an unmet precondition.
    #[error("bad sequence of commands: {0}")]
    StateViolation(String),
}

impl From<config::ConfigError> for MailError {
    fn from(e: config::ConfigError) -> Self {
        MailError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MailError>;
