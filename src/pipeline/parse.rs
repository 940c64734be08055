//! MIME decoding — raw message bytes to a normalized `ParsedMail`.

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::types::{ParsedAttachment, ParsedMail};
use crate::store::models::MessageHeader;

/// Caps applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_headers: usize,
    pub max_header_value_len: usize,
    pub max_attachment_bytes: usize,
}

/// Parse raw RFC 822 bytes into normalized form.
pub fn parse_message(raw: &[u8], limits: &ParseLimits) -> Result<ParsedMail, PipelineError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(PipelineError::Parse)?;

    let mut recipients = Vec::new();
    collect_addresses(parsed.to(), &mut recipients);
    collect_addresses(parsed.cc(), &mut recipients);
    collect_addresses(parsed.bcc(), &mut recipients);
    recipients.dedup();

    let from_addr = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".into());

    let mut headers = Vec::new();
    for header in parsed.root_part().headers() {
        if headers.len() >= limits.max_headers {
            debug!(cap = limits.max_headers, "Header count cap reached");
            break;
        }
        let value = header_value_string(&header.value);
        if value.is_empty() {
            continue;
        }
        headers.push(MessageHeader {
            name: header.name.as_str().to_string(),
            value: truncate(&value, limits.max_header_value_len),
        });
    }

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let contents = part.contents();
        let filename = part.attachment_name().unwrap_or("attachment").to_string();
        if contents.len() > limits.max_attachment_bytes {
            warn!(
                filename = %filename,
                size = contents.len(),
                max = limits.max_attachment_bytes,
                "Skipping oversized attachment"
            );
            continue;
        }
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".into());

        attachments.push(ParsedAttachment {
            filename,
            content_type,
            bytes: contents.to_vec(),
        });
    }

    let date = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    Ok(ParsedMail {
        message_id: parsed.message_id().map(|s| s.to_string()),
        subject: parsed.subject().map(|s| s.to_string()),
        from_addr,
        recipients,
        text_body: parsed.body_text(0).map(|s| s.to_string()),
        html_body: parsed.body_html(0).map(|s| s.to_string()),
        headers,
        attachments,
        date,
    })
}

/// Derive the idempotency key for a message.
///
/// Prefers the protocol Message-ID. Without one, the key is synthesized
/// from (domain id, protocol UID) — stable across retries on the same
/// connection, not portable across a UID epoch change. A message carrying
/// neither gets a random key and cannot be deduplicated.
pub fn dedup_key(message_id: Option<&str>, domain_id: Uuid, uid: Option<u32>) -> String {
    if let Some(mid) = message_id {
        let trimmed = mid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    match uid {
        Some(uid) => format!("uid-{domain_id}-{uid}"),
        None => format!("gen-{}", Uuid::new_v4()),
    }
}

fn collect_addresses(addr: Option<&Address<'_>>, out: &mut Vec<String>) {
    if let Some(addr) = addr {
        for a in addr.iter() {
            if let Some(email) = a.address() {
                let email = email.to_lowercase();
                if !out.contains(&email) {
                    out.push(email);
                }
            }
        }
    }
}

/// Render a header value as storable text. Structured values that have no
/// useful text form come back empty and are dropped by the caller.
fn header_value_string(value: &HeaderValue<'_>) -> String {
    match value {
        HeaderValue::Text(t) => t.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(addr) => {
            let mut parts = Vec::new();
            for a in addr.iter() {
                if let Some(email) = a.address() {
                    parts.push(email.to_string());
                }
            }
            parts.join(", ")
        }
        HeaderValue::DateTime(dt) => dt.to_rfc3339(),
        HeaderValue::ContentType(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        },
        _ => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
