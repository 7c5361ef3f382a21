use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::security::{CredentialValidator, TlsConfig};
use crate::smtp::session::SmtpSession;
use crate::submit::Submitter;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

/// Accepts SMTP connections, gating concurrency with a process-wide
/// semaphore rather than per-IP bookkeeping — matching the per-process
/// cap a Kubernetes pod's own CPU/memory limits already impose.
pub struct SmtpServer {
    config: Config,
    tls_config: Option<Arc<TlsConfig>>,
    validator: Arc<CredentialValidator>,
    submitter: Arc<Submitter>,
    metrics: Arc<Metrics>,
    connection_permits: Arc<Semaphore>,
}

impl SmtpServer {
    /// Fails fast if a cert/key path is configured but can't be loaded —
    /// a broken TLS configuration must stop startup, not silently
    /// disable STARTTLS.
    pub fn new(config: Config) -> Result<Self> {
        let tls_config = if config.tls_enabled() {
            let tls = TlsConfig::from_pem_files(
                config.tls_cert_path.as_ref().unwrap(),
                config.tls_key_path.as_ref().unwrap(),
            )?;
            Some(Arc::new(tls))
        } else {
            None
        };

        let validator = Arc::new(CredentialValidator::new(&config));
        let submitter = Arc::new(Submitter::new(&config));
        let metrics = Arc::new(Metrics::default());
        let connection_permits = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            tls_config,
            validator,
            submitter,
            metrics,
            connection_permits,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Accepts connections until `shutdown` fires, then stops accepting
    /// and returns — in-flight sessions finish on their own.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.smtp_bind_addr).await?;
        info!(addr = %self.config.smtp_bind_addr, tls = self.tls_config.is_some(), "SMTP listener ready");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.spawn_session(socket, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_session(&self, socket: tokio::net::TcpStream, addr: std::net::SocketAddr) {
        let permits = self.connection_permits.clone();
        let config = self.config.clone();
        let tls_config = self.tls_config.clone();
        let validator = self.validator.clone();
        let submitter = self.submitter.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.try_acquire_owned() else {
                warn!(%addr, "connection cap reached, rejecting");
                use tokio::io::AsyncWriteExt;
                let mut socket = socket;
                let _ = socket
                    .write_all(b"421 4.3.2 Service not available, too many connections\r\n")
                    .await;
                return;
            };

            metrics.active_connections.fetch_add(1, Ordering::Relaxed);
            metrics.connections_total.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            info!(%addr, "connection accepted");

            let session = SmtpSession::new(&config, tls_config, validator, submitter, metrics.clone());
            if let Err(e) = session.handle(socket).await {
                warn!(%addr, error = %e, "session ended with error");
            }

            metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug_duration(started.elapsed());
        });
    }
}

fn debug_duration(elapsed: std::time::Duration) {
    tracing::debug!(duration_ms = elapsed.as_millis(), "connection closed");
}
