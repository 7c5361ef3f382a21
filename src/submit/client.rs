use crate::config::Config;
use crate::error::{MailError, Result};
use crate::mime::ParsedMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of fanning a [`ParsedMessage`] out to its recipients.
#[derive(Debug, Clone, Default)]
pub struct SubmissionOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub message_ids: Vec<String>,
}

#[derive(Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct AttachmentPayload<'a> {
    filename: &'a str,
    content_type: &'a str,
    content: &'a str,
    size: usize,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    from: EmailAddress<'a>,
    to: [EmailAddress<'a>; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<AttachmentPayload<'a>>,
}

#[derive(Deserialize, Default)]
struct SubmitResponse {
    message_id: Option<String>,
    id: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

enum RecipientResult {
    Success(String),
    Failure(String),
}

/// Submits one recipient at a time to the email API, matching the
/// per-recipient classification table rather than treating the whole
/// envelope as a single request.
#[derive(Clone)]
pub struct Submitter {
    client: reqwest::Client,
    email_url: String,
    per_attempt_timeout: Duration,
    extra_retries: u32,
}

impl Submitter {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            email_url: config.email_api_url.clone(),
            per_attempt_timeout: Duration::from_secs(config.email_api_timeout_secs),
            extra_retries: config.email_api_retries,
        }
    }

    pub async fn submit(&self, api_key: &str, parsed: &ParsedMessage) -> Result<SubmissionOutcome> {
        let recipients = parsed.all_recipients();
        if recipients.is_empty() {
            return Err(MailError::Validation("no recipients specified".to_string()));
        }

        let mut outcome = SubmissionOutcome::default();

        for recipient in &recipients {
            match self.submit_to_recipient(api_key, parsed, recipient).await? {
                RecipientResult::Success(message_id) => {
                    outcome.succeeded.push(recipient.clone());
                    outcome.message_ids.push(message_id);
                }
                RecipientResult::Failure(reason) => {
                    outcome.failed.push((recipient.clone(), reason));
                }
            }
        }

        if outcome.succeeded.is_empty() {
            let summary = outcome
                .failed
                .iter()
                .map(|(addr, reason)| format!("{}: {}", addr, reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(MailError::Validation(format!("all recipients failed: {}", summary)));
        }

        info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "message submitted with partial or full success"
        );

        Ok(outcome)
    }

    /// `Ok(Failure)` short-circuits nothing; `Err` (rate-limit) aborts the
    /// whole fan-out, per the aggregate-level classification.
    async fn submit_to_recipient(
        &self,
        api_key: &str,
        parsed: &ParsedMessage,
        recipient: &str,
    ) -> Result<RecipientResult> {
        let body = SubmitRequest {
            from: EmailAddress { email: &parsed.from },
            to: [EmailAddress { email: recipient }],
            subject: &parsed.subject,
            text: &parsed.body_text,
            html: parsed.body_html.as_deref(),
            attachments: parsed
                .attachments
                .iter()
                .map(|a| AttachmentPayload {
                    filename: &a.filename,
                    content_type: &a.content_type,
                    content: &a.content,
                    size: a.size,
                })
                .collect(),
        };

        let max_attempts = self.extra_retries + 1;

        for attempt in 0..max_attempts {
            debug!(recipient, attempt = attempt + 1, "submitting to email API");

            let outcome = self
                .client
                .post(format!("{}/email", self.email_url))
                .timeout(self.per_attempt_timeout)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 200 || status.as_u16() == 202 {
                        let data: SubmitResponse = response.json().await.unwrap_or_default();
                        return Ok(match data.message_id.or(data.id) {
                            Some(id) if !id.is_empty() => RecipientResult::Success(id),
                            _ => RecipientResult::Failure(
                                "invalid API response: missing message_id".to_string(),
                            ),
                        });
                    }

                    if status.as_u16() == 400 {
                        let data: SubmitResponse = response.json().await.unwrap_or_default();
                        let reason = data.error.or(data.message).unwrap_or_else(|| "validation error".to_string());
                        warn!(recipient, "email validation failed for recipient");
                        return Ok(RecipientResult::Failure(reason));
                    }

                    if status.as_u16() == 429 {
                        warn!("rate limit exceeded");
                        return Err(MailError::RateLimit);
                    }

                    if status.is_server_error() {
                        return Ok(RecipientResult::Failure(format!("API server error: {}", status)));
                    }

                    return Ok(RecipientResult::Failure(format!("unexpected API response: {}", status)));
                }
                Err(e) => {
                    if attempt < self.extra_retries {
                        warn!(recipient, error = %e, "retrying after transport error");
                        continue;
                    }
                    return Ok(RecipientResult::Failure(format!("network error: {}", e)));
                }
            }
        }

        unreachable!("loop always returns within max_attempts iterations")
    }
}
