use crate::error::MailError;

/// One SMTP reply line: a three-digit code plus human-readable text
/// (already including the enhanced status code where the table calls
/// for one).
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    /// Renders a (possibly multi-line) reply in wire format, e.g.
    /// `"250-PIPELINING\r\n250 OK\r\n"`.
    pub fn to_wire(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

/// Maps a DATA-phase failure to its SMTP reply, per the classification
/// table: format errors are permanent, everything upstream is transient
/// except rate-limit, which gets its own enhanced status code.
pub fn reply_for_data_error(err: &MailError) -> Reply {
    match err {
        MailError::Format(detail) => Reply::new(550, format!("5.6.0 Message rejected: {}", detail)),
        MailError::Validation(detail) => Reply::new(550, format!("5.6.0 Message rejected: {}", detail)),
        MailError::RateLimit => Reply::new(451, "4.7.1 Rate limit exceeded, try again later"),
        MailError::Server(detail) => Reply::new(451, format!("4.3.0 Temporary failure, try again later: {}", detail)),
        MailError::Network(detail) => Reply::new(451, format!("4.4.0 Service temporarily unavailable: {}", detail)),
        MailError::MessageTooLarge { max } => {
            Reply::new(552, format!("5.3.4 Message exceeds maximum size of {} bytes", max))
        }
        other => Reply::new(451, format!("4.3.0 Temporary failure: {}", other)),
    }
}

pub fn auth_success() -> Reply {
    Reply::new(235, "2.7.0 Authentication successful")
}

pub fn auth_failed() -> Reply {
    Reply::new(535, "5.7.8 Authentication failed")
}

pub fn auth_malformed() -> Reply {
    Reply::new(535, "5.7.8 Authentication credentials invalid")
}

pub fn auth_temporary_failure() -> Reply {
    Reply::new(451, "4.7.0 Temporary authentication failure")
}

pub fn auth_requires_tls() -> Reply {
    Reply::new(530, "5.7.0 Must issue STARTTLS first")
}

pub fn not_authenticated() -> Reply {
    Reply::new(530, "5.7.0 Authentication required")
}

pub fn bad_sequence(what: &str) -> Reply {
    Reply::new(503, format!("5.5.1 Bad sequence of commands: {}", what))
}

pub fn too_many_recipients(max: usize) -> Reply {
    Reply::new(452, format!("4.5.3 Too many recipients, max {}", max))
}
