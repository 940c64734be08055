//! Pipeline input/output types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::models::{Domain, MessageHeader};

/// The owning-account context a message is ingested under.
#[derive(Debug, Clone)]
pub struct IngestContext {
    /// External account the message was fetched from.
    pub account_id: Uuid,
    pub domain: Domain,
    /// `None` for catch-all accounts; the fixed target for personal ones.
    pub personal_mailbox_id: Option<Uuid>,
}

/// A parsed attachment kept in memory until delivery.
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Normalized form of a MIME message.
#[derive(Debug, Clone)]
pub struct ParsedMail {
    /// Message-ID header, when present.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from_addr: String,
    /// All To/Cc/Bcc addresses, lowercased.
    pub recipients: Vec<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub headers: Vec<MessageHeader>,
    pub attachments: Vec<ParsedAttachment>,
    pub date: Option<DateTime<Utc>>,
}

impl ParsedMail {
    /// Estimated bytes the delivery would occupy in storage.
    pub fn estimated_bytes(&self) -> u64 {
        let body = self.text_body.as_ref().map_or(0, |b| b.len())
            + self.html_body.as_ref().map_or(0, |b| b.len());
        let attachments: usize = self.attachments.iter().map(|a| a.bytes.len()).sum();
        (body + attachments) as u64
    }

    /// Files the delivery would create: one per body part plus attachments.
    pub fn estimated_files(&self) -> u32 {
        let bodies =
            u32::from(self.text_body.is_some()) + u32::from(self.html_body.is_some());
        bodies + self.attachments.len() as u32
    }
}

/// What happened to one candidate recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// A canonical message was created for this mailbox.
    Delivered { mailbox_id: Uuid },
    /// A canonical message already existed; skipped.
    Duplicate { mailbox_id: Uuid },
    /// No matching mailbox (or an inactive one); audited only.
    Unmatched { address: String },
}

/// Result of ingesting one raw message.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub dedup_key: String,
    pub candidates: Vec<CandidateOutcome>,
    /// Set when the audit insert found an existing record.
    pub audit_duplicate: bool,
}

impl IngestOutcome {
    pub fn delivered_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c, CandidateOutcome::Delivered { .. }))
            .count()
    }
}

/// Running error counter for one sync batch.
///
/// One message's failure never aborts the batch; it is counted here and the
/// batch continues.
#[derive(Debug, Default)]
pub struct BatchStats {
    pub attempted: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub errors: usize,
}
