use std::collections::HashMap;

/// A decoded attachment, ready to be base64-embedded in a submission request.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64-encoded payload.
    pub content: String,
    /// Decoded (pre-base64) byte length.
    pub size: usize,
}

/// The structured result of parsing a raw `DATA` byte blob.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reply_to: String,
    pub message_id: String,
    pub date: String,
    pub custom_headers: HashMap<String, String>,
}

impl ParsedMessage {
    /// `to`, `cc`, and `bcc` concatenated in that order, for fan-out.
    pub fn all_recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .cloned()
            .collect()
    }
}
