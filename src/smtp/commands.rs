//! SMTP command line parsing, per RFC 5321.

use crate::error::{MailError, Result};

/// A parsed command line. `MailFrom`/`RcptTo` carry the bare address plus
/// any trailing ESMTP parameters (e.g. `SIZE=1024`), passed through
/// opaque to the envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String, Vec<String>),
    RcptTo(String, Vec<String>),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// `AUTH mechanism [initial-response]`.
    Auth(String, Option<String>),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_ascii_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires a domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                let (addr, options) = parse_path_and_options(args, "FROM:")?;
                Ok(SmtpCommand::MailFrom(addr, options))
            }
            "RCPT" => {
                let (addr, options) = parse_path_and_options(args, "TO:")?;
                Ok(SmtpCommand::RcptTo(addr, options))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("AUTH requires a mechanism".to_string()));
                }
                let auth_parts: Vec<&str> = args.splitn(2, ' ').collect();
                let mechanism = auth_parts[0].to_string();
                let initial_response = auth_parts.get(1).map(|s| s.to_string());
                Ok(SmtpCommand::Auth(mechanism, initial_response))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }
}

/// Parses `FROM:<addr> PARAM=VALUE ...` (or `TO:` for RCPT), returning
/// the bare address and the trailing parameter tokens verbatim.
fn parse_path_and_options(args: &str, prefix: &str) -> Result<(String, Vec<String>)> {
    if !args.to_ascii_uppercase().starts_with(prefix) {
        return Err(MailError::SmtpProtocol(format!("expected {}", prefix)));
    }

    let rest = args[prefix.len()..].trim_start();
    let mut tokens = rest.splitn(2, ' ');
    let path = tokens.next().unwrap_or("").trim();
    let options = tokens
        .next()
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let address = if path.starts_with('<') && path.ends_with('>') {
        &path[1..path.len() - 1]
    } else {
        path
    };

    Ok((address.to_string(), options))
}
