use crate::error::{MailError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::HashMap;

use super::types::{Attachment, ParsedMessage};

/// Decodes a raw `DATA` byte blob into a [`ParsedMessage`].
///
/// Operates on bytes throughout, not on a lossily-decoded string: header
/// folding and boundary splitting are byte-level operations so binary
/// attachment payloads survive untouched until their own
/// Content-Transfer-Encoding is applied.
pub struct MimeParser;

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl MimeParser {
    pub fn parse(message: &[u8]) -> Result<ParsedMessage> {
        let (header_bytes, body) = split_headers_body(message);
        let headers = parse_headers(header_bytes);

        let from_raw = header_last(&headers, "from")
            .ok_or_else(|| MailError::Format("missing From header".to_string()))?;
        if from_raw.trim().is_empty() {
            return Err(MailError::Format("empty From header".to_string()));
        }
        let from = decode_rfc2047(&from_raw);

        let to = parse_address_list(&header_last(&headers, "to").unwrap_or_default());
        let cc = parse_address_list(&header_last(&headers, "cc").unwrap_or_default());
        let bcc = parse_address_list(&header_last(&headers, "bcc").unwrap_or_default());

        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            return Err(MailError::Format(
                "message has no To, Cc, or Bcc recipients".to_string(),
            ));
        }

        let subject = decode_rfc2047(&header_last(&headers, "subject").unwrap_or_default());
        let reply_to = decode_rfc2047(&header_last(&headers, "reply-to").unwrap_or_default());
        let message_id = header_last(&headers, "message-id").unwrap_or_default();
        let date = header_last(&headers, "date").unwrap_or_default();

        let mut custom_headers = HashMap::new();
        for (name, value) in &headers {
            if name.starts_with("X-") {
                custom_headers.insert(name.clone(), decode_rfc2047(value));
            }
        }

        let content_type = header_last(&headers, "content-type")
            .unwrap_or_else(|| "text/plain; charset=us-ascii".to_string());
        let encoding = header_last(&headers, "content-transfer-encoding");
        let disposition = header_last(&headers, "content-disposition");

        let mut bodies = Bodies::default();
        walk_part(&content_type, encoding.as_deref(), disposition.as_deref(), body, &mut bodies);

        Ok(ParsedMessage {
            from,
            to,
            cc,
            bcc,
            subject,
            body_text: bodies.text.unwrap_or_default(),
            body_html: bodies.html,
            attachments: bodies.attachments,
            reply_to,
            message_id,
            date,
            custom_headers,
        })
    }
}

/// Pre-order walk of a (possibly multipart) MIME tree, populating `out`
/// with the first text/plain part, the first text/html part, and every
/// attachment encountered.
fn walk_part(
    content_type_header: &str,
    encoding: Option<&str>,
    disposition: Option<&str>,
    body: &[u8],
    out: &mut Bodies,
) {
    let (mime_type, ct_params) = parse_header_value(content_type_header);

    if mime_type.starts_with("multipart/") {
        let Some(boundary) = ct_params.get("boundary").cloned() else {
            return;
        };
        for (part_headers, part_body) in split_multipart(&boundary, body) {
            let part_content_type = header_last(&part_headers, "content-type")
                .unwrap_or_else(|| "text/plain; charset=us-ascii".to_string());
            let part_encoding = header_last(&part_headers, "content-transfer-encoding");
            let part_disposition = header_last(&part_headers, "content-disposition");
            walk_part(
                &part_content_type,
                part_encoding.as_deref(),
                part_disposition.as_deref(),
                &part_body,
                out,
            );
        }
        return;
    }

    let (_, disp_params) = disposition.map(|d| parse_header_value(d)).unwrap_or_default();
    let disposition_lower = disposition.map(|d| d.to_ascii_lowercase()).unwrap_or_default();

    let filename = disp_params
        .get("filename")
        .or_else(|| ct_params.get("name"))
        .map(|f| decode_rfc2047(f));

    let is_text = mime_type == "text/plain" || mime_type == "text/html";
    let is_attachment = disposition_lower.contains("attachment")
        || disposition_lower.contains("inline")
        || (!is_text && filename.is_some());

    if is_attachment {
        if let Some(filename) = filename {
            let decoded = decode_transfer_encoding(body, encoding);
            out.attachments.push(Attachment {
                filename,
                content_type: mime_type,
                size: decoded.len(),
                content: BASE64.encode(&decoded),
            });
        }
        return;
    }

    if mime_type == "text/plain" && out.text.is_none() {
        let decoded = decode_transfer_encoding(body, encoding);
        let charset = ct_params.get("charset").map(String::as_str).unwrap_or("utf-8");
        out.text = Some(decode_charset(&decoded, charset));
    } else if mime_type == "text/html" && out.html.is_none() {
        let decoded = decode_transfer_encoding(body, encoding);
        let charset = ct_params.get("charset").map(String::as_str).unwrap_or("utf-8");
        out.html = Some(decode_charset(&decoded, charset));
    }
}

fn decode_transfer_encoding(body: &[u8], encoding: Option<&str>) -> Vec<u8> {
    match encoding.map(|e| e.to_ascii_lowercase()) {
        Some(ref e) if e.contains("base64") => {
            let cleaned: Vec<u8> = body.iter().filter(|b| !b.is_ascii_whitespace()).copied().collect();
            BASE64.decode(&cleaned).unwrap_or_default()
        }
        Some(ref e) if e.contains("quoted-printable") => {
            quoted_printable::decode(body, quoted_printable::ParseMode::Robust)
                .unwrap_or_else(|_| body.to_vec())
        }
        _ => body.to_vec(),
    }
}

fn decode_charset(bytes: &[u8], charset: &str) -> String {
    let encoding = encoding_rs::Encoding::for_label(charset.as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (decoded, _, _) = encoding.decode(bytes);
    decoded.into_owned()
}

/// Splits a raw byte blob into `(header bytes, body bytes)` at the first
/// blank line, tolerating bare `\n\n` as well as `\r\n\r\n`.
fn split_headers_body(message: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(message, b"\r\n\r\n") {
        (&message[..pos], &message[pos + 4..])
    } else if let Some(pos) = find(message, b"\n\n") {
        (&message[..pos], &message[pos + 2..])
    } else {
        (message, &[])
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a header block into `(name, value)` pairs in source order,
/// joining folded continuation lines with a single space. Names keep
/// their original case so the leading-`X-` rule stays case-sensitive.
fn parse_headers(header_bytes: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(header_bytes);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            headers.push((name, value));
        }
    }

    headers
}

fn header_last(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .rev()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Parses `type/subtype; param=value; ...` into the lowercased type and a
/// map of lowercased parameter names to unquoted values.
fn parse_header_value(value: &str) -> (String, HashMap<String, String>) {
    let mut parts = value.split(';');
    let main = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut params = HashMap::new();

    for param in parts {
        let param = param.trim();
        if let Some(eq) = param.find('=') {
            let key = param[..eq].trim().to_ascii_lowercase();
            let val = param[eq + 1..].trim().trim_matches('"').to_string();
            params.insert(key, val);
        }
    }

    (main, params)
}

/// Splits a multipart body on `--boundary` markers, returning each
/// section's parsed headers and raw (still-encoded) body bytes.
fn split_multipart(boundary: &str, body: &[u8]) -> Vec<(Vec<(String, String)>, Vec<u8>)> {
    let marker = format!("--{}", boundary);
    let marker = marker.as_bytes();

    let mut sections = Vec::new();
    let mut positions = Vec::new();
    let mut search_from = 0;
    while let Some(rel) = find(&body[search_from..], marker) {
        positions.push(search_from + rel);
        search_from += rel + marker.len();
    }

    for window in positions.windows(2) {
        let start = window[0] + marker.len();
        let end = window[1];
        if start >= body.len() {
            continue;
        }
        let section = trim_bytes(&body[start..end.min(body.len())]);
        if section.is_empty() || section.starts_with(b"--") {
            continue;
        }
        let (header_bytes, part_body) = split_headers_body(section);
        sections.push((parse_headers(header_bytes), part_body.to_vec()));
    }

    sections
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map(|p| p + 1).unwrap_or(start);
    &bytes[start..end]
}

/// Decodes every `=?charset?B|Q?text?=` encoded-word in `input` (RFC 2047),
/// passing through anything that isn't one.
fn decode_rfc2047(input: &str) -> String {
    let mut result = String::new();
    let mut rest = input;

    loop {
        match rest.find("=?") {
            Some(start) => {
                result.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                match try_decode_encoded_word(after) {
                    Some((decoded, consumed)) => {
                        result.push_str(&decoded);
                        rest = &after[consumed..];
                        let trimmed = rest.trim_start_matches([' ', '\t']);
                        if trimmed.starts_with("=?") {
                            rest = trimmed;
                        }
                    }
                    None => {
                        result.push_str("=?");
                        rest = after;
                    }
                }
            }
            None => {
                result.push_str(rest);
                break;
            }
        }
    }

    result
}

fn try_decode_encoded_word(s: &str) -> Option<(String, usize)> {
    let q1 = s.find('?')?;
    let charset = &s[..q1];
    let after_charset = &s[q1 + 1..];
    let q2 = after_charset.find('?')?;
    let enc = &after_charset[..q2];
    let after_enc = &after_charset[q2 + 1..];
    let end = after_enc.find("?=")?;
    let encoded_text = &after_enc[..end];

    let bytes = match enc.to_ascii_uppercase().as_str() {
        "B" => BASE64.decode(encoded_text).ok()?,
        "Q" => decode_q_encoding(encoded_text),
        _ => return None,
    };

    let decoded = decode_charset(&bytes, charset);
    let consumed = q1 + 1 + q2 + 1 + end + 2;
    Some((decoded, consumed))
}

fn decode_q_encoding(s: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '_' => out.push(b' '),
            '=' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte);
                } else {
                    out.push(b'=');
                    out.extend(hex.as_bytes());
                }
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

/// Splits an address-list header into bare addresses, dropping display
/// names (`"Name <addr>"` → `addr`). Respects quoted strings and angle
/// brackets when splitting on commas.
fn parse_address_list(value: &str) -> Vec<String> {
    split_respecting_quotes_and_angles(value)
        .into_iter()
        .filter_map(|token| {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            if let (Some(start), Some(end)) = (token.find('<'), token.rfind('>')) {
                let addr = token[start + 1..end].trim();
                if addr.is_empty() {
                    None
                } else {
                    Some(addr.to_string())
                }
            } else {
                Some(token.to_string())
            }
        })
        .collect()
}

fn split_respecting_quotes_and_angles(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut angle_depth = 0i32;

    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                angle_depth += 1;
                current.push(c);
            }
            '>' if !in_quotes => {
                angle_depth -= 1;
                current.push(c);
            }
            ',' if !in_quotes && angle_depth == 0 => {
                result.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        result.push(current);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_from_header() {
        let msg = b"To: a@example.com\r\n\r\nbody";
        assert!(matches!(MimeParser::parse(msg), Err(MailError::Format(_))));
    }

    #[test]
    fn requires_at_least_one_recipient_header() {
        let msg = b"From: a@example.com\r\n\r\nbody";
        assert!(matches!(MimeParser::parse(msg), Err(MailError::Format(_))));
    }

    #[test]
    fn parses_simple_plain_text_message() {
        let msg = b"From: sender@example.com\r\nTo: rcpt@example.com\r\nSubject: Hi\r\n\r\nHello World";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.from, "sender@example.com");
        assert_eq!(parsed.to, vec!["rcpt@example.com"]);
        assert_eq!(parsed.body_text, "Hello World");
        assert!(parsed.body_html.is_none());
    }

    #[test]
    fn drops_display_names_from_recipient_lists() {
        let msg = b"From: Sender <sender@example.com>\r\nTo: Alice <alice@example.com>, bob@example.com\r\n\r\nBody";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.from, "Sender <sender@example.com>");
        assert_eq!(parsed.to, vec!["alice@example.com", "bob@example.com"]);
    }

    #[test]
    fn decodes_rfc2047_subject() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: =?UTF-8?B?SGVsbG8=?=\r\n\r\nBody";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.subject, "Hello");
    }

    #[test]
    fn walks_nested_multipart_for_both_bodies() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nContent-Type: multipart/mixed; boundary=\"outer\"\r\n\r\n--outer\r\nContent-Type: multipart/alternative; boundary=\"inner\"\r\n\r\n--inner\r\nContent-Type: text/plain\r\n\r\nPlain part\r\n--inner\r\nContent-Type: text/html\r\n\r\n<p>HTML part</p>\r\n--inner--\r\n--outer--\r\n";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.body_text, "Plain part");
        assert_eq!(parsed.body_html, Some("<p>HTML part</p>".to_string()));
    }

    #[test]
    fn captures_attachment_by_content_disposition() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nBody\r\n--b\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"file.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nSGVsbG8=\r\n--b--\r\n";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.body_text, "Body");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "file.pdf");
        assert_eq!(parsed.attachments[0].size, 5);
    }

    #[test]
    fn skips_attachment_parts_with_no_filename() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: application/octet-stream\r\nContent-Disposition: attachment\r\n\r\ndata\r\n--b--\r\n";
        let parsed = MimeParser::parse(msg).unwrap();
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn captures_custom_x_headers_last_occurrence_wins() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nX-Custom: first\r\nX-Custom: second\r\n\r\nBody";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.custom_headers.get("X-Custom"), Some(&"second".to_string()));
    }

    #[test]
    fn falls_back_to_utf8_on_unknown_charset() {
        let msg = b"From: a@example.com\r\nTo: b@example.com\r\nContent-Type: text/plain; charset=bogus-charset\r\n\r\nplain ascii";
        let parsed = MimeParser::parse(msg).unwrap();
        assert_eq!(parsed.body_text, "plain ascii");
    }
}
