//! Credential validation against the upstream authentication API.
//!
//! SMTP `AUTH` never checks a local user store; every attempt is an HTTP
//! round trip to `{auth_api_url}/validate`. A successful call returns an
//! API key, which is then threaded through to the submission API for the
//! rest of the connection's lifetime.

use crate::config::Config;
use crate::error::{MailError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// SASL mechanisms this gateway advertises and accepts.
///
/// A single variant today, but kept as an enum (rather than a bare
/// string) so a future `Login` addition is a match-arm, not a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
}

impl AuthMechanism {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
        }
    }
}

/// Decodes a SASL PLAIN initial response: `\0authcid\0password`, base64.
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| MailError::SmtpProtocol(format!("invalid base64: {}", e)))?;

    let parts: Vec<&str> = std::str::from_utf8(&decoded)
        .map_err(|e| MailError::SmtpProtocol(format!("invalid utf-8: {}", e)))?
        .split('\0')
        .collect();

    if parts.len() != 3 {
        return Err(MailError::SmtpProtocol(
            "malformed AUTH PLAIN response".to_string(),
        ));
    }

    if parts[1].is_empty() || parts[2].is_empty() {
        return Err(MailError::SmtpProtocol(
            "username and password must be non-empty".to_string(),
        ));
    }

    Ok((parts[1].to_string(), parts[2].to_string()))
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    api_key: Option<String>,
}

/// Validates SMTP credentials against the configured auth API.
#[derive(Clone)]
pub struct CredentialValidator {
    client: reqwest::Client,
    auth_url: String,
    per_attempt_timeout: Duration,
    extra_retries: u32,
}

const RETRY_DELAYS_MS: [u64; 2] = [500, 1000];

impl CredentialValidator {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_url: config.auth_api_url.clone(),
            per_attempt_timeout: Duration::from_secs(config.auth_api_timeout_secs),
            extra_retries: config.auth_api_retries,
        }
    }

    /// Validates `username`/`password` and returns the upstream API key.
    ///
    /// Retries on 5xx and on network/timeout errors, up to `extra_retries`
    /// additional attempts with a 500ms/1s backoff; 401/403 and other 4xx
    /// responses are terminal and never retried.
    pub async fn validate(&self, username: &str, password: &str) -> Result<String> {
        let max_attempts = self.extra_retries + 1;
        let mut last_err: Option<MailError> = None;

        for attempt in 0..max_attempts {
            debug!(username, attempt = attempt + 1, max_attempts, "validating credentials");

            let outcome = self
                .client
                .post(format!("{}/validate", self.auth_url))
                .timeout(self.per_attempt_timeout)
                .json(&ValidateRequest { username, password })
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 200 {
                        let body: ValidateResponse = response
                            .json()
                            .await
                            .map_err(|e| MailError::Server(format!("malformed auth response: {}", e)))?;

                        return match body.api_key {
                            Some(key) if !key.is_empty() => Ok(key),
                            _ => Err(MailError::Server("auth API returned no api_key".to_string())),
                        };
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        warn!(username, %status, "authentication rejected");
                        return Err(MailError::Authentication);
                    }

                    if status.is_server_error() {
                        last_err = Some(MailError::Server(format!("auth API returned {}", status)));
                        if attempt < self.extra_retries {
                            tokio::time::sleep(Duration::from_millis(
                                RETRY_DELAYS_MS[attempt as usize % RETRY_DELAYS_MS.len()],
                            ))
                            .await;
                            continue;
                        }
                        return Err(last_err.unwrap());
                    }

                    return Err(MailError::Server(format!(
                        "unexpected auth API response: {}",
                        status
                    )));
                }
                Err(e) => {
                    last_err = Some(MailError::Network(e.to_string()));
                    if attempt < self.extra_retries {
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_DELAYS_MS[attempt as usize % RETRY_DELAYS_MS.len()],
                        ))
                        .await;
                        continue;
                    }
                    return Err(last_err.unwrap());
                }
            }
        }

        Err(last_err.unwrap_or(MailError::Network(
            "authentication request failed after all retries".to_string(),
        )))
    }
}
