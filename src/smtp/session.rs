//! Per-connection SMTP state machine.
//!
//! Commands are gated on prior state (TLS established, authenticated,
//! sender set, recipients accumulated); every deviation returns the
//! matching extended-status reply instead of tearing down the connection.

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::metrics::Metrics;
use crate::mime::MimeParser;
use crate::security::{decode_plain_auth, AuthMechanism, CredentialValidator, TlsConfig};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::reply::{self, Reply};
use crate::submit::Submitter;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

const MAX_LINE_LENGTH: usize = 1000;
const MAX_ERRORS: usize = 10;

/// Unified stream type so STARTTLS can replace the transport in place
/// without the caller's loop ever seeing two different types.
enum SmtpStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Only observable for the instant between taking the plain stream
    /// out and putting the TLS stream back; any I/O here is a bug.
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SmtpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SmtpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SmtpStream::Tls(s) => Pin::new(s).poll_flush(cx),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SmtpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            SmtpStream::Upgrading => panic!("I/O attempted on SmtpStream mid-STARTTLS-upgrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

enum SessionResult {
    Continue,
    Quit,
}

/// The envelope accumulated between `MAIL FROM` and the matching `DATA`.
#[derive(Default)]
struct Envelope {
    mail_from: Option<String>,
    rcpt_tos: Vec<String>,
    #[allow(dead_code)]
    mail_options: Vec<String>,
    #[allow(dead_code)]
    rcpt_options: Vec<String>,
}

/// State for a single TCP connection, owned by the task that handles it —
/// never looked up by peer address, so two sessions behind the same NAT
/// IP can never see each other's authentication state.
pub struct SmtpSession {
    state: SmtpState,
    envelope: Envelope,
    hostname: String,
    max_message_size: usize,
    max_recipients: usize,
    tls_config: Option<Arc<TlsConfig>>,
    validator: Arc<CredentialValidator>,
    submitter: Arc<Submitter>,
    metrics: Arc<Metrics>,
    is_encrypted: bool,
    api_key: Option<String>,
    error_count: usize,
    command_timeout: Duration,
    data_timeout: Duration,
    helo_domain: Option<String>,
}

impl SmtpSession {
    pub fn new(
        config: &Config,
        tls_config: Option<Arc<TlsConfig>>,
        validator: Arc<CredentialValidator>,
        submitter: Arc<Submitter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            envelope: Envelope::default(),
            hostname: config.smtp_hostname.clone(),
            max_message_size: config.max_message_size,
            max_recipients: config.max_recipients,
            tls_config,
            validator,
            submitter,
            metrics,
            is_encrypted: false,
            api_key: None,
            error_count: 0,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            data_timeout: Duration::from_secs(config.data_timeout_secs),
            helo_domain: None,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut smtp_stream = SmtpStream::Plain(stream);

        smtp_stream
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.hostname).as_bytes())
            .await?;

        loop {
            match self.process_commands(&mut smtp_stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut line = String::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("too many errors, disconnecting");
                buf_reader.write_all(b"421 4.3.0 Too many errors, closing connection\r\n").await?;
                return Ok(SessionResult::Quit);
            }

            line.clear();

            let n = match timeout(self.command_timeout, buf_reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!("idle timeout, disconnecting");
                    buf_reader.write_all(b"421 4.4.2 Idle timeout, closing connection\r\n").await?;
                    return Ok(SessionResult::Quit);
                }
            };

            if n == 0 {
                debug!("client disconnected");
                return Ok(SessionResult::Quit);
            }

            if line.len() > MAX_LINE_LENGTH {
                buf_reader.write_all(b"500 5.5.2 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let line_trimmed = line.trim_end();

            match SmtpCommand::parse(line_trimmed) {
                Ok(SmtpCommand::Starttls) => {
                    drop(buf_reader);
                    match self.handle_starttls_upgrade(stream).await {
                        Ok(true) => return Ok(SessionResult::Continue),
                        Ok(false) => {
                            buf_reader = BufReader::new(&mut *stream);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(SmtpCommand::Auth(mechanism, initial_response)) => {
                    self.handle_auth(&mechanism, initial_response, &mut buf_reader).await?;
                }
                Ok(SmtpCommand::Data) if self.preconditions_met_for_data() => {
                    buf_reader
                        .write_all(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                        .await?;
                    self.state = SmtpState::Data;
                    if let Err(e) = self.receive_data_and_submit(&mut buf_reader).await {
                        error!(%e, "DATA transaction failed");
                        buf_reader.write_all(reply::reply_for_data_error(&e).to_wire().as_bytes()).await?;
                        self.error_count += 1;
                    }
                    self.reset_envelope();
                }
                Ok(cmd) => {
                    let reply = self.handle_command(cmd);
                    buf_reader.write_all(reply.to_wire().as_bytes()).await?;
                    if reply.code == 221 {
                        return Ok(SessionResult::Quit);
                    }
                }
                Err(_) => {
                    buf_reader.write_all(b"500 5.5.2 Syntax error, command unrecognized\r\n").await?;
                    self.error_count += 1;
                }
            }
        }
    }

    fn preconditions_met_for_data(&self) -> bool {
        self.state == SmtpState::RcptTo
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> Reply {
        match (self.state, cmd) {
            (SmtpState::Fresh, SmtpCommand::Helo(domain)) => {
                self.helo_domain = Some(domain.clone());
                self.state = SmtpState::Greeted;
                Reply::new(250, format!("{} Hello {}", self.hostname, domain))
            }
            (SmtpState::Fresh, SmtpCommand::Ehlo(domain)) => {
                self.helo_domain = Some(domain.clone());
                self.state = SmtpState::Greeted;
                self.ehlo_reply(&domain)
            }
            (_, SmtpCommand::Helo(domain)) => {
                // HELO/EHLO are accepted in any state per §4.5.
                self.helo_domain = Some(domain.clone());
                Reply::new(250, format!("{} Hello {}", self.hostname, domain))
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                // A fresh EHLO after STARTTLS, per RFC 3207; also accepted
                // in any other state per §4.5.
                self.helo_domain = Some(domain.clone());
                self.ehlo_reply(&domain)
            }
            (_, SmtpCommand::MailFrom(from, options)) => self.handle_mail_from(from, options),
            (_, SmtpCommand::RcptTo(to, options)) => self.handle_rcpt_to(to, options),
            (_, SmtpCommand::Rset) => {
                self.reset_envelope();
                self.state = SmtpState::Greeted;
                Reply::new(250, "2.0.0 OK")
            }
            (_, SmtpCommand::Noop) => Reply::new(250, "2.0.0 OK"),
            (_, SmtpCommand::Quit) => Reply::new(221, format!("2.0.0 {} closing connection", self.hostname)),
            (_, SmtpCommand::Data) => reply::bad_sequence("DATA requires MAIL FROM and at least one RCPT TO"),
            (_, SmtpCommand::Starttls) | (_, SmtpCommand::Auth(_, _)) => {
                reply::bad_sequence("STARTTLS/AUTH handled earlier in the pipeline")
            }
            (_, SmtpCommand::Unknown(cmd)) => Reply::new(502, format!("5.5.1 Command not implemented: {}", cmd)),
        }
    }

    fn ehlo_reply(&self, domain: &str) -> Reply {
        let mut lines = vec![format!("{} Hello {}", self.hostname, domain)];

        if self.tls_config.is_some() && !self.is_encrypted {
            lines.push("STARTTLS".to_string());
        }
        if self.is_encrypted {
            lines.push("AUTH PLAIN".to_string());
        }
        lines.push(format!("SIZE {}", self.max_message_size));
        lines.push("8BITMIME".to_string());
        lines.push("SMTPUTF8".to_string());
        lines.push("PIPELINING".to_string());

        let mut text = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i + 1 == lines.len() {
                text.push_str(line);
            } else {
                text.push_str(&format!("{}\r\n250-", line));
            }
        }
        Reply::new(250, text)
    }

    fn handle_mail_from(&mut self, from: String, options: Vec<String>) -> Reply {
        if self.api_key.is_none() {
            return reply::not_authenticated();
        }

        info!(%from, "MAIL FROM");
        self.envelope = Envelope {
            mail_from: Some(from),
            rcpt_tos: Vec::new(),
            mail_options: options,
            rcpt_options: Vec::new(),
        };
        self.state = SmtpState::MailFrom;
        Reply::new(250, "2.1.0 OK")
    }

    fn handle_rcpt_to(&mut self, to: String, options: Vec<String>) -> Reply {
        if self.api_key.is_none() {
            return reply::not_authenticated();
        }
        if self.envelope.mail_from.is_none() {
            return reply::bad_sequence("RCPT TO before MAIL FROM");
        }
        if self.envelope.rcpt_tos.len() >= self.max_recipients {
            return reply::too_many_recipients(self.max_recipients);
        }

        info!(%to, "RCPT TO");
        self.envelope.rcpt_tos.push(to);
        self.envelope.rcpt_options.extend(options);
        self.state = SmtpState::RcptTo;
        Reply::new(250, "2.1.5 OK")
    }

    fn reset_envelope(&mut self) {
        self.envelope = Envelope::default();
        if self.state == SmtpState::Data || self.state == SmtpState::MailFrom || self.state == SmtpState::RcptTo {
            self.state = SmtpState::Greeted;
        }
    }

    /// Reads the dot-stuffed body, parses it, submits it, and writes the
    /// terminal reply. Any error is mapped to a reply by the caller.
    async fn receive_data_and_submit<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = self.receive_data(buf_reader).await?;

        let parsed = MimeParser::parse(&raw)?;

        let api_key = self.api_key.clone().ok_or_else(|| {
            error!("DATA reached with no API key on an authenticated session");
            MailError::StateViolation("missing API key".to_string())
        })?;

        match self.submitter.submit(&api_key, &parsed).await {
            Ok(outcome) => {
                self.metrics.emails_submitted.fetch_add(outcome.succeeded.len() as u64, std::sync::atomic::Ordering::Relaxed);
                let ids = outcome.message_ids.join(",");
                buf_reader
                    .write_all(Reply::new(250, format!("2.0.0 Message accepted for delivery: {}", ids)).to_wire().as_bytes())
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.metrics.emails_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = match timeout(self.data_timeout, buf_reader.read_until(b'\n', &mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(MailError::SmtpProtocol("timeout during DATA".to_string())),
            };

            if n == 0 {
                return Err(MailError::SmtpProtocol("connection closed during DATA".to_string()));
            }

            if line.len() > MAX_LINE_LENGTH {
                return Err(MailError::SmtpProtocol("line too long during DATA".to_string()));
            }

            let trimmed: &[u8] = trim_crlf(&line);
            if trimmed == b"." {
                break;
            }

            let new_size = data.len() + line.len();
            if new_size > self.max_message_size {
                return Err(MailError::MessageTooLarge { max: self.max_message_size });
            }

            if line.starts_with(b"..") {
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
        }

        Ok(data)
    }

    async fn handle_starttls_upgrade(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls_config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                stream.write_all(b"502 5.5.1 STARTTLS not available\r\n").await?;
                return Ok(false);
            }
        };

        if self.is_encrypted {
            stream.write_all(b"503 5.5.1 Already using TLS\r\n").await?;
            return Ok(false);
        }

        stream.write_all(b"220 2.0.0 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            _ => return Err(MailError::StateViolation("stream not plain at STARTTLS".to_string())),
        };

        let acceptor = tls_config.acceptor();
        let tls_stream = acceptor
            .accept(tcp_stream)
            .await
            .map_err(|e| MailError::Tls(format!("handshake failed: {}", e)))?;

        *stream = SmtpStream::Tls(tls_stream);
        self.is_encrypted = true;
        self.state = SmtpState::Fresh;
        self.api_key = None;
        self.envelope = Envelope::default();

        info!("STARTTLS upgrade complete");
        Ok(true)
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.is_encrypted {
            buf_reader.write_all(reply::auth_requires_tls().to_wire().as_bytes()).await?;
            return Ok(());
        }

        let Some(AuthMechanism::Plain) = AuthMechanism::from_str(mechanism) else {
            buf_reader.write_all(b"504 5.5.4 Authentication mechanism not supported\r\n").await?;
            return Ok(());
        };

        let auth_data = match initial_response {
            Some(data) => data,
            None => {
                buf_reader.write_all(b"334 \r\n").await?;
                let mut line = String::new();
                timeout(self.command_timeout, buf_reader.read_line(&mut line))
                    .await
                    .map_err(|_| MailError::SmtpProtocol("AUTH timeout".to_string()))??;
                line.trim().to_string()
            }
        };

        let (username, password) = match decode_plain_auth(&auth_data) {
            Ok(pair) => pair,
            Err(_) => {
                self.api_key = None;
                buf_reader.write_all(reply::auth_malformed().to_wire().as_bytes()).await?;
                self.error_count += 1;
                return Ok(());
            }
        };

        self.metrics.auth_attempts_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match self.validator.validate(&username, &password).await {
            Ok(api_key) => {
                self.api_key = Some(api_key);
                info!(%username, "authentication succeeded");
                buf_reader.write_all(reply::auth_success().to_wire().as_bytes()).await?;
            }
            Err(MailError::Authentication) => {
                self.api_key = None;
                self.metrics.auth_failures_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(%username, "authentication rejected by upstream");
                buf_reader.write_all(reply::auth_failed().to_wire().as_bytes()).await?;
                self.error_count += 1;
            }
            Err(e) => {
                warn!(%username, error = %e, "authentication temporarily unavailable");
                buf_reader.write_all(reply::auth_temporary_failure().to_wire().as_bytes()).await?;
            }
        }

        Ok(())
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
