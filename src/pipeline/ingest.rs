//! Message ingestion pipeline.
//!
//! One call per fetched message: parse → dedup key → recipient resolution →
//! idempotent audit insert → per-mailbox canonical delivery → side effects.
//!
//! **Core invariant: the transport may hand us the same message twice; we
//! must never deliver it twice.** The dedup key plus the idempotent audit
//! and canonical inserts turn the transport's at-least-once into
//! at-most-once delivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::notify::{AutomationTrigger, RealtimePublisher};
use crate::pipeline::parse::{ParseLimits, dedup_key, parse_message};
use crate::pipeline::types::{CandidateOutcome, IngestContext, IngestOutcome, ParsedMail};
use crate::storage::{StorageProvider, object_path, safe_filename};
use crate::store::models::{
    CanonicalMessage, DomainPolicy, InboundAuditRecord, Mailbox, MessageAttachment,
};
use crate::store::traits::{InsertOutcome, MetadataStore};

/// The ingestion pipeline. One instance is shared by all workers.
pub struct IngestPipeline {
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageProvider>,
    publisher: Arc<dyn RealtimePublisher>,
    automation: Arc<dyn AutomationTrigger>,
    limits: ParseLimits,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageProvider>,
        publisher: Arc<dyn RealtimePublisher>,
        automation: Arc<dyn AutomationTrigger>,
        limits: ParseLimits,
    ) -> Self {
        Self {
            store,
            storage,
            publisher,
            automation,
            limits,
        }
    }

    /// Ingest one raw message fetched under `ctx`.
    pub async fn ingest(
        &self,
        ctx: &IngestContext,
        raw: &[u8],
        uid: Option<u32>,
    ) -> Result<IngestOutcome, PipelineError> {
        let mail = parse_message(raw, &self.limits)?;
        let key = dedup_key(mail.message_id.as_deref(), ctx.domain.id, uid);

        debug!(
            account = %ctx.account_id,
            dedup_key = %key,
            from = %mail.from_addr,
            "Ingesting message"
        );

        let received_at = mail.date.unwrap_or_else(Utc::now);

        // Audit first: every message addressed to the domain is captured,
        // delivered or not. A conflict means a retry already recorded it.
        let audit = InboundAuditRecord {
            id: Uuid::new_v4(),
            dedup_key: key.clone(),
            domain_id: ctx.domain.id,
            from_addr: mail.from_addr.clone(),
            recipients: mail.recipients.clone(),
            subject: mail.subject.clone(),
            received_at,
        };
        let audit_duplicate =
            self.store.insert_audit_record(&audit).await? == InsertOutcome::AlreadyRecorded;

        let mut candidates = Vec::new();
        match ctx.personal_mailbox_id {
            Some(mailbox_id) => {
                match self.store.get_mailbox(mailbox_id).await? {
                    Some(mailbox) if mailbox.is_active => {
                        candidates.push(self.deliver(&mail, &key, &mailbox, received_at).await?);
                    }
                    _ => {
                        warn!(account = %ctx.account_id, mailbox = %mailbox_id,
                            "Personal target mailbox missing or inactive");
                        candidates.push(CandidateOutcome::Unmatched {
                            address: mailbox_id.to_string(),
                        });
                    }
                }
            }
            None => {
                for address in &mail.recipients {
                    if !ctx.domain.owns_address(address) {
                        continue;
                    }
                    let outcome = self.deliver_candidate(ctx, &mail, &key, address, received_at);
                    candidates.push(outcome.await?);
                }
            }
        }

        if candidates.is_empty() {
            return Err(PipelineError::NoRecipients);
        }

        Ok(IngestOutcome {
            dedup_key: key,
            candidates,
            audit_duplicate,
        })
    }

    /// Resolve one catch-all candidate address and deliver if it matches an
    /// active internal mailbox.
    async fn deliver_candidate(
        &self,
        ctx: &IngestContext,
        mail: &ParsedMail,
        key: &str,
        address: &str,
        received_at: chrono::DateTime<Utc>,
    ) -> Result<CandidateOutcome, PipelineError> {
        let matched = self
            .store
            .find_mailbox_by_address(ctx.domain.id, address)
            .await?
            .filter(|mb| mb.is_active);

        let mailbox = match matched {
            Some(mb) => mb,
            None => {
                // Unmatched candidate: delivery depends on domain policy.
                let fallback = match &ctx.domain.policy {
                    DomainPolicy::KnownRecipientsOnly => None,
                    DomainPolicy::DeliverAll {
                        fallback_mailbox_id,
                    } => match fallback_mailbox_id {
                        Some(id) => self.store.get_mailbox(*id).await?.filter(|mb| mb.is_active),
                        None => None,
                    },
                };
                match fallback {
                    Some(mb) => mb,
                    None => {
                        debug!(address = %address, "No matching mailbox; audited only");
                        return Ok(CandidateOutcome::Unmatched {
                            address: address.to_string(),
                        });
                    }
                }
            }
        };

        self.deliver(mail, key, &mailbox, received_at).await
    }

    /// Deliver one message into one mailbox, idempotently.
    async fn deliver(
        &self,
        mail: &ParsedMail,
        key: &str,
        mailbox: &Mailbox,
        received_at: chrono::DateTime<Utc>,
    ) -> Result<CandidateOutcome, PipelineError> {
        if self.store.canonical_exists(key, mailbox.id).await? {
            debug!(dedup_key = %key, mailbox = %mailbox.address, "Already delivered; skipping");
            return Ok(CandidateOutcome::Duplicate {
                mailbox_id: mailbox.id,
            });
        }

        let estimated = mail.estimated_bytes();
        let truncated = mailbox.would_exceed_quota(estimated);
        let message_id = Uuid::new_v4();

        let mut body_text_path = None;
        let mut body_html_path = None;
        let mut attachment_rows: Vec<MessageAttachment> = Vec::new();
        let mut stored_bytes: u64 = 0;
        let mut stored_files: u32 = 0;

        if truncated {
            warn!(
                mailbox = %mailbox.address,
                needed = estimated,
                used = mailbox.storage_used_bytes,
                quota = mailbox.storage_quota_bytes,
                "Storage quota exceeded; delivering truncated message"
            );
        } else {
            if let Some(ref text) = mail.text_body {
                let path = object_path(message_id, received_at, "body.txt");
                body_text_path = Some(self.storage.write(&path, text.as_bytes()).await?);
                stored_bytes += text.len() as u64;
                stored_files += 1;
            }
            if let Some(ref html) = mail.html_body {
                let path = object_path(message_id, received_at, "body.html");
                body_html_path = Some(self.storage.write(&path, html.as_bytes()).await?);
                stored_bytes += html.len() as u64;
                stored_files += 1;
            }
            for (i, attachment) in mail.attachments.iter().enumerate() {
                let part = format!("{}-{}", i, safe_filename(&attachment.filename));
                let path = object_path(message_id, received_at, &part);
                let stored = self.storage.write(&path, &attachment.bytes).await?;
                attachment_rows.push(MessageAttachment {
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    size_bytes: attachment.bytes.len() as u64,
                    path: stored,
                });
                stored_bytes += attachment.bytes.len() as u64;
                stored_files += 1;
            }
        }

        let message = CanonicalMessage {
            id: message_id,
            mailbox_id: mailbox.id,
            dedup_key: key.to_string(),
            subject: mail.subject.clone(),
            from_addr: mail.from_addr.clone(),
            to_addrs: mail.recipients.clone(),
            body_text_path,
            body_html_path,
            size_bytes: stored_bytes,
            file_count: stored_files,
            truncated,
            received_at,
        };

        match self
            .store
            .insert_canonical_message(&message, &mail.headers, &attachment_rows)
            .await?
        {
            InsertOutcome::AlreadyRecorded => {
                // Lost a race with a concurrent retry; their row wins.
                Ok(CandidateOutcome::Duplicate {
                    mailbox_id: mailbox.id,
                })
            }
            InsertOutcome::Inserted => {
                if stored_bytes > 0 {
                    self.store
                        .add_storage_usage(mailbox.id, stored_bytes, stored_files)
                        .await?;
                }
                self.store
                    .advance_mailbox_watermark(mailbox.id, received_at)
                    .await?;

                info!(
                    mailbox = %mailbox.address,
                    message = %message_id,
                    truncated,
                    "Message delivered"
                );

                self.fire_side_effects(message, mailbox.clone());
                Ok(CandidateOutcome::Delivered {
                    mailbox_id: mailbox.id,
                })
            }
        }
    }

    /// Fire-and-forget side effects. Never blocks or fails the pipeline.
    fn fire_side_effects(&self, message: CanonicalMessage, mailbox: Mailbox) {
        let publisher = Arc::clone(&self.publisher);
        let automation = Arc::clone(&self.automation);

        tokio::spawn(async move {
            let user_id = mailbox.user_id.clone();

            if mailbox.is_archived {
                debug!(mailbox = %mailbox.address, "Archived mailbox; realtime push skipped");
            } else {
                let event = serde_json::json!({
                    "type": "message.received",
                    "mailbox_id": message.mailbox_id,
                    "message_id": message.id,
                    "subject": message.subject,
                    "from": message.from_addr,
                });
                publisher.publish(&user_id, event).await;
            }

            automation.on_message(&message, &mailbox, &user_id).await;
        });
    }
}
