//! End-to-end tests driving a real `SmtpServer` over TCP (with a real
//! STARTTLS handshake against a freshly generated dev cert) against
//! `wiremock`-mocked Auth and Email APIs. These exercise the scenarios
//! from the testable-properties list: full command sequencing, the
//! AUTH retry schedule, per-recipient fan-out classification, and the
//! size/recipient boundary checks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as RustlsError, ServerName};
use serde_json::json;
use smtp_gateway::config::Config;
use smtp_gateway::security::dev_cert::generate_self_signed_cert;
use smtp_gateway::smtp::SmtpServer;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Accepts whatever certificate the test server presents — the dev cert
/// is self-signed and the client has no reason to trust a CA for it.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

fn test_tls_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Returns a port that was free at the moment of the call. Racy in
/// theory, fine for a local test suite that doesn't run concurrently
/// against the same port range.
fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Replays a fixed sequence of responses, holding the last one once
/// exhausted — lets a test assert exact retry counts against a server
/// that returns 5xx twice then succeeds, for example.
struct Sequence(Vec<ResponseTemplate>, AtomicUsize);

impl Sequence {
    fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self(responses, AtomicUsize::new(0))
    }
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.1.fetch_add(1, Ordering::SeqCst);
        self.0[i.min(self.0.len() - 1)].clone()
    }
}

fn base_config(bind_addr: String, auth_url: String, email_url: String) -> Config {
    Config {
        smtp_bind_addr: bind_addr,
        smtp_hostname: "mail.test.local".to_string(),
        tls_cert_path: None,
        tls_key_path: None,
        auth_api_url: auth_url,
        email_api_url: email_url,
        max_message_size: 1024 * 1024,
        max_recipients: 100,
        max_connections: 50,
        command_timeout_secs: 5,
        data_timeout_secs: 5,
        auth_api_timeout_secs: 2,
        email_api_timeout_secs: 2,
        auth_api_retries: 2,
        email_api_retries: 1,
        log_level: "error".to_string(),
        log_format: "pretty".to_string(),
    }
}

/// Spawns an `SmtpServer` with STARTTLS enabled against a freshly
/// generated dev certificate, returning the bind address once the
/// listener is ready to accept.
async fn spawn_server(mut config: Config) -> String {
    let cert_file = NamedTempFile::new().unwrap();
    let key_file = NamedTempFile::new().unwrap();
    generate_self_signed_cert(
        "localhost",
        cert_file.path().to_str().unwrap(),
        key_file.path().to_str().unwrap(),
    )
    .unwrap();
    config.tls_cert_path = Some(cert_file.path().to_str().unwrap().to_string());
    config.tls_key_path = Some(key_file.path().to_str().unwrap().to_string());

    let addr = config.smtp_bind_addr.clone();
    let server = SmtpServer::new(config).unwrap();
    let (_tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = server.run(rx).await;
        // keep the temp cert/key files alive for the server's lifetime
        drop((cert_file, key_file));
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    addr
}

struct Client<S> {
    io: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self { io: BufReader::new(stream) }
    }

    async fn read_reply(&mut self) -> (u16, String) {
        let mut full = String::new();
        loop {
            let mut line = String::new();
            read_line(&mut self.io, &mut line).await;
            assert!(line.len() >= 4, "short reply line: {:?}", line);
            let code: u16 = line[0..3].parse().unwrap_or_else(|_| panic!("bad reply {:?}", line));
            let continuation = line.as_bytes()[3] == b'-';
            full.push_str(line.trim_end());
            full.push('\n');
            if !continuation {
                return (code, full);
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.io.write_all(line.as_bytes()).await.unwrap();
        self.io.write_all(b"\r\n").await.unwrap();
        self.io.flush().await.unwrap();
    }

    async fn send_data_block(&mut self, body: &str) {
        self.io.write_all(body.as_bytes()).await.unwrap();
        self.io.write_all(b"\r\n.\r\n").await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Like [`Self::send_data_block`], but `raw` must already end in
    /// `\r\n` — used where the test needs to control the exact byte
    /// count the server accumulates, line by line.
    async fn send_data_exact(&mut self, raw: &str) {
        self.io.write_all(raw.as_bytes()).await.unwrap();
        self.io.write_all(b".\r\n").await.unwrap();
        self.io.flush().await.unwrap();
    }

    fn into_inner(self) -> S {
        self.io.into_inner()
    }
}

/// `BufReader::read_line` assumes UTF-8; SMTP replies always are, but we
/// read raw bytes and validate ourselves for a clearer panic on garbage.
async fn read_line<S: AsyncRead + Unpin>(io: &mut BufReader<S>, out: &mut String) {
    let mut byte = [0u8; 1];
    loop {
        let n = io.read(&mut byte).await.unwrap();
        assert!(n == 1, "connection closed mid-reply");
        out.push(byte[0] as char);
        if out.ends_with('\n') {
            return;
        }
    }
}

fn plain_auth(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

/// Drives EHLO → STARTTLS → EHLO over a fresh connection, returning a
/// client ready for AUTH/MAIL/RCPT/DATA.
async fn connect_and_starttls(addr: &str) -> Client<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut plain = Client::new(tcp);

    let (code, _) = plain.read_reply().await;
    assert_eq!(code, 220);

    plain.send("EHLO client.test").await;
    let (code, _) = plain.read_reply().await;
    assert_eq!(code, 250);

    plain.send("STARTTLS").await;
    let (code, _) = plain.read_reply().await;
    assert_eq!(code, 220);

    let tcp = plain.into_inner();
    let connector = test_tls_connector();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls_stream = connector.connect(server_name, tcp).await.unwrap();
    let mut tls_client = Client::new(tls_stream);

    tls_client.send("EHLO client.test").await;
    let (code, _) = tls_client.read_reply().await;
    assert_eq!(code, 250);

    tls_client
}

async fn auth(client: &mut Client<tokio_rustls::client::TlsStream<TcpStream>>, user: &str, pass: &str) -> u16 {
    client.send(&format!("AUTH PLAIN {}", plain_auth(user, pass))).await;
    client.read_reply().await.0
}

async fn mock_auth_ok(auth_server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"api_key": "test-key"})))
        .mount(auth_server)
        .await;
}

#[tokio::test]
async fn single_recipient_happy_path() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;

    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-1"})))
        .mount(&email_server)
        .await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    assert_eq!(auth(&mut client, "u@x.com", "pw").await, 235);

    client.send("MAIL FROM:<s@x.com>").await;
    assert_eq!(client.read_reply().await.0, 250);

    client.send("RCPT TO:<r@x.com>").await;
    assert_eq!(client.read_reply().await.0, 250);

    client.send("DATA").await;
    assert_eq!(client.read_reply().await.0, 354);

    client
        .send_data_block("From: s@x.com\r\nTo: r@x.com\r\nSubject: T\r\n\r\nbody")
        .await;
    let (code, text) = client.read_reply().await;
    assert_eq!(code, 250);
    assert!(text.contains("m-1"));
}

#[tokio::test]
async fn three_recipients_one_rejected() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;

    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-a"})))
        .mount(&email_server)
        .await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    // Recipient-specific overrides layered on top of the generic 200
    // above: b@x.com gets a 400, the rest fall through to m-a.
    Mock::given(method("POST"))
        .and(path("/email"))
        .and(BodyContains("b@x.com".to_string()))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad"})))
        .mount(&email_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .and(BodyContains("c@x.com".to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-c"})))
        .mount(&email_server)
        .await;

    let mut client = connect_and_starttls(&addr).await;
    assert_eq!(auth(&mut client, "u@x.com", "pw").await, 235);

    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    for rcpt in ["a@x.com", "b@x.com", "c@x.com"] {
        client.send(&format!("RCPT TO:<{}>", rcpt)).await;
        assert_eq!(client.read_reply().await.0, 250);
    }

    client.send("DATA").await;
    client.read_reply().await;
    client
        .send_data_block("From: s@x.com\r\nTo: a@x.com, b@x.com, c@x.com\r\n\r\nbody")
        .await;
    let (code, text) = client.read_reply().await;
    assert_eq!(code, 250);
    assert!(text.contains("m-a"));
    assert!(text.contains("m-c"));
}

#[tokio::test]
async fn pre_tls_auth_refused() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;
    let email_server = MockServer::start().await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let tcp = TcpStream::connect(&addr).await.unwrap();
    let mut client = Client::new(tcp);
    client.read_reply().await;
    client.send("EHLO client.test").await;
    let (_, ehlo_text) = client.read_reply().await;
    assert!(!ehlo_text.contains("AUTH"), "AUTH must not be advertised before STARTTLS");

    client.send(&format!("AUTH PLAIN {}", plain_auth("u@x.com", "pw"))).await;
    let (code, _) = client.read_reply().await;
    assert!(code == 530 || code == 538);

    // Session stays open: STARTTLS is still usable afterward.
    client.send("STARTTLS").await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);
}

#[tokio::test]
async fn all_recipients_fail_returns_550() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;

    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&email_server)
        .await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    for rcpt in ["a@x.com", "b@x.com"] {
        client.send(&format!("RCPT TO:<{}>", rcpt)).await;
        client.read_reply().await;
    }
    client.send("DATA").await;
    client.read_reply().await;
    client
        .send_data_block("From: s@x.com\r\nTo: a@x.com, b@x.com\r\n\r\nbody")
        .await;
    let (code, text) = client.read_reply().await;
    assert_eq!(code, 550);
    assert!(text.contains("a@x.com") && text.contains("b@x.com"));
}

#[tokio::test]
async fn rate_limit_short_circuits_fanout() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;

    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m"})))
        .mount(&email_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .and(BodyContains("b@x.com".to_string()))
        .respond_with(ResponseTemplate::new(429))
        .mount(&email_server)
        .await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    for rcpt in ["a@x.com", "b@x.com", "c@x.com"] {
        client.send(&format!("RCPT TO:<{}>", rcpt)).await;
        client.read_reply().await;
    }
    client.send("DATA").await;
    client.read_reply().await;
    client
        .send_data_block("From: s@x.com\r\nTo: a@x.com, b@x.com, c@x.com\r\n\r\nbody")
        .await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 451);

    let requests = email_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2, "c@x.com must not be attempted after the 429 on b@x.com");
}

#[tokio::test]
async fn multipart_alternative_both_bodies_present() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;

    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-1"})))
        .mount(&email_server)
        .await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    client.send("RCPT TO:<r@x.com>").await;
    client.read_reply().await;
    client.send("DATA").await;
    client.read_reply().await;

    let body = "From: s@x.com\r\nTo: r@x.com\r\nContent-Type: multipart/alternative; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nHi\r\n--b\r\nContent-Type: text/html\r\n\r\n<p>Hi</p>\r\n--b--";
    client.send_data_block(body).await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 250);

    let requests = email_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let sent: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(sent["text"], "Hi");
    assert_eq!(sent["html"], "<p>Hi</p>");
}

#[tokio::test]
async fn max_recipients_boundary() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;
    let email_server = MockServer::start().await;

    let port = free_port();
    let mut config = base_config(format!("127.0.0.1:{}", port), auth_server.uri(), email_server.uri());
    config.max_recipients = 2;
    let addr = spawn_server(config).await;

    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;

    client.send("RCPT TO:<a@x.com>").await;
    assert_eq!(client.read_reply().await.0, 250);
    client.send("RCPT TO:<b@x.com>").await;
    assert_eq!(client.read_reply().await.0, 250);
    client.send("RCPT TO:<c@x.com>").await;
    assert_eq!(client.read_reply().await.0, 452);
}

#[tokio::test]
async fn message_size_boundary() {
    let auth_server = MockServer::start().await;
    mock_auth_ok(&auth_server).await;
    let email_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m"})))
        .mount(&email_server)
        .await;

    // The server accumulates raw bytes line by line (CRLF included),
    // excluding the terminating "." line — this string's length is
    // exactly what it measures against `max_message_size`.
    let message = "From: s@x.com\r\nTo: r@x.com\r\n\r\nHELLO\r\n";

    let port = free_port();
    let mut config = base_config(format!("127.0.0.1:{}", port), auth_server.uri(), email_server.uri());
    config.max_message_size = message.len();
    let addr = spawn_server(config).await;

    // Exactly at the cap: accepted.
    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    client.send("RCPT TO:<r@x.com>").await;
    client.read_reply().await;
    client.send("DATA").await;
    client.read_reply().await;
    client.send_data_exact(message).await;
    assert_eq!(client.read_reply().await.0, 250);

    // One byte over: rejected.
    let port = free_port();
    let mut config = base_config(format!("127.0.0.1:{}", port), auth_server.uri(), email_server.uri());
    config.max_message_size = message.len() - 1;
    let addr = spawn_server(config).await;

    let mut client = connect_and_starttls(&addr).await;
    auth(&mut client, "u@x.com", "pw").await;
    client.send("MAIL FROM:<s@x.com>").await;
    client.read_reply().await;
    client.send("RCPT TO:<r@x.com>").await;
    client.read_reply().await;
    client.send("DATA").await;
    client.read_reply().await;
    client.send_data_exact(message).await;
    assert_eq!(client.read_reply().await.0, 552);
}

#[tokio::test]
async fn auth_retries_then_gives_up() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/validate"))
        .respond_with(Sequence::new(vec![ResponseTemplate::new(500); 3]))
        .mount(&auth_server)
        .await;
    let email_server = MockServer::start().await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    let code = auth(&mut client, "u@x.com", "pw").await;
    assert_eq!(code, 451);

    let requests = auth_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn auth_retries_then_succeeds() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/validate"))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(500),
            ResponseTemplate::new(200).set_body_json(json!({"api_key": "test-key"})),
        ]))
        .mount(&auth_server)
        .await;
    let email_server = MockServer::start().await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    let code = auth(&mut client, "u@x.com", "pw").await;
    assert_eq!(code, 235);

    let requests = auth_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn auth_with_empty_api_key_is_not_treated_as_success() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"api_key": ""})))
        .mount(&auth_server)
        .await;
    let email_server = MockServer::start().await;

    let port = free_port();
    let addr = spawn_server(base_config(
        format!("127.0.0.1:{}", port),
        auth_server.uri(),
        email_server.uri(),
    ))
    .await;

    let mut client = connect_and_starttls(&addr).await;
    let code = auth(&mut client, "u@x.com", "pw").await;
    assert_eq!(code, 451);

    client.send("MAIL FROM:<s@x.com>").await;
    assert_eq!(client.read_reply().await.0, 530, "empty api_key must not count as authenticated");
}

/// Matches a request whose raw body contains `needle` — used to give a
/// mocked recipient-specific response without parsing the JSON back out.
struct BodyContains(String);

impl wiremock::Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(&self.0)
    }
}
