//! Unified `MetadataStore` trait — single async interface for all persistence.
//!
//! The ingestion subsystem only ever talks to this trait; the libSQL backend
//! is one implementation. Every mutation here must be safe to retry: a crash
//! between a sync pass and a cursor persist may only cause a small tail of
//! messages to be reprocessed, never corruption — the idempotent audit and
//! canonical inserts absorb the replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::models::{
    CanonicalMessage, Domain, ExternalMailbox, InboundAuditRecord, Mailbox, MessageAttachment,
    MessageHeader,
};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same dedup key already existed; treated as success.
    AlreadyRecorded,
}

/// Backend-agnostic metadata store covering external accounts, domains,
/// mailboxes, audit records, and canonical messages.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── External accounts ───────────────────────────────────────────

    /// Desired set of accounts the fleet should be connected to.
    async fn list_active_external_mailboxes(&self) -> Result<Vec<ExternalMailbox>, DatabaseError>;

    async fn get_external_mailbox(
        &self,
        id: Uuid,
    ) -> Result<Option<ExternalMailbox>, DatabaseError>;

    async fn insert_external_mailbox(&self, account: &ExternalMailbox)
    -> Result<(), DatabaseError>;

    /// Persist the sync cursor. Worker-owned; called only after the
    /// corresponding batch has been durably processed.
    async fn update_sync_cursor(
        &self,
        id: Uuid,
        last_synced_uid: u32,
        last_uid_validity: Option<u32>,
    ) -> Result<(), DatabaseError>;

    /// Clear error counters and stamp a successful sync.
    async fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Increment the consecutive-error counter and record the error text.
    async fn record_sync_error(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    // ── Domains and mailboxes ───────────────────────────────────────

    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>, DatabaseError>;

    async fn insert_domain(&self, domain: &Domain) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError>;

    /// Look up an internal mailbox by exact address within a domain.
    async fn find_mailbox_by_address(
        &self,
        domain_id: Uuid,
        address: &str,
    ) -> Result<Option<Mailbox>, DatabaseError>;

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError>;

    /// Advance the mailbox's "last message received" watermark, only if
    /// `at` is newer than the current value.
    async fn advance_mailbox_watermark(
        &self,
        mailbox_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Add to a mailbox's storage accounting after bodies were written.
    async fn add_storage_usage(
        &self,
        mailbox_id: Uuid,
        bytes: u64,
        files: u32,
    ) -> Result<(), DatabaseError>;

    // ── Audit trail ─────────────────────────────────────────────────

    /// Append an audit record. Unique on (dedup_key, domain_id); a
    /// conflicting insert is reported as `AlreadyRecorded`, not an error.
    async fn insert_audit_record(
        &self,
        record: &InboundAuditRecord,
    ) -> Result<InsertOutcome, DatabaseError>;

    // ── Canonical messages ──────────────────────────────────────────

    async fn canonical_exists(
        &self,
        dedup_key: &str,
        mailbox_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Persist a canonical message with its header and attachment rows as
    /// one atomic unit. Unique on (dedup_key, mailbox_id); a conflict is
    /// reported as `AlreadyRecorded`.
    async fn insert_canonical_message(
        &self,
        message: &CanonicalMessage,
        headers: &[MessageHeader],
        attachments: &[MessageAttachment],
    ) -> Result<InsertOutcome, DatabaseError>;

    async fn get_canonical_message(
        &self,
        dedup_key: &str,
        mailbox_id: Uuid,
    ) -> Result<Option<CanonicalMessage>, DatabaseError>;

    /// Number of canonical messages in a mailbox. Used by tests and the
    /// health sweep.
    async fn count_canonical_messages(&self, mailbox_id: Uuid) -> Result<u64, DatabaseError>;
}
