//! Persistent entities for the ingestion subsystem.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use uuid::Uuid;

/// How messages fetched from an external account map to internal mailboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The account is a catch-all for a managed domain; every To/Cc/Bcc
    /// address under the domain suffix is a delivery candidate.
    CatchAll,
    /// The account feeds exactly one internal mailbox.
    Personal { mailbox_id: Uuid },
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::CatchAll => "catch_all",
            DeliveryMode::Personal { .. } => "personal",
        }
    }
}

/// What happens to a candidate address with no matching internal mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPolicy {
    /// Unmatched candidates are audited but never delivered.
    KnownRecipientsOnly,
    /// Unmatched candidates fall back to a designated mailbox when one is
    /// configured, otherwise they are audited only.
    DeliverAll { fallback_mailbox_id: Option<Uuid> },
}

/// A managed inbound domain.
#[derive(Debug, Clone)]
pub struct Domain {
    pub id: Uuid,
    /// Address suffix, e.g. `acme.example`.
    pub name: String,
    pub policy: DomainPolicy,
}

impl Domain {
    /// Whether `address` falls under this domain's suffix.
    pub fn owns_address(&self, address: &str) -> bool {
        address
            .rsplit_once('@')
            .is_some_and(|(_, dom)| dom.eq_ignore_ascii_case(&self.name))
    }
}

/// One configured external IMAP account.
///
/// Connection parameters are owned by the configuration collaborator;
/// cursor and health fields are owned and mutated only by the worker.
#[derive(Debug, Clone)]
pub struct ExternalMailbox {
    pub id: Uuid,
    pub domain_id: Uuid,
    /// Cosmetic display label; never forces a reconnect when changed.
    pub label: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
    pub mode: DeliveryMode,
    pub is_active: bool,

    // Sync cursor
    pub last_synced_uid: u32,
    pub last_uid_validity: Option<u32>,

    // Health
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// An internal mailbox that canonical messages are delivered into.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub address: String,
    pub user_id: String,
    pub is_active: bool,
    pub is_archived: bool,
    /// "Last message received" watermark; only advanced by newer messages.
    pub last_message_at: Option<DateTime<Utc>>,
    pub storage_used_bytes: u64,
    pub storage_file_count: u32,
    /// 0 means unlimited.
    pub storage_quota_bytes: u64,
}

impl Mailbox {
    /// Whether adding `bytes` more would exceed this mailbox's quota.
    pub fn would_exceed_quota(&self, bytes: u64) -> bool {
        self.storage_quota_bytes > 0
            && self.storage_used_bytes.saturating_add(bytes) > self.storage_quota_bytes
    }
}

/// Append-only capture of every message addressed to a managed domain,
/// whether or not it matched an internal mailbox.
#[derive(Debug, Clone)]
pub struct InboundAuditRecord {
    pub id: Uuid,
    pub dedup_key: String,
    pub domain_id: Uuid,
    pub from_addr: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// The per-mailbox delivered entity.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalMessage {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub dedup_key: String,
    pub subject: Option<String>,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    /// Storage-provider path of the plain-text body, when stored.
    pub body_text_path: Option<String>,
    /// Storage-provider path of the HTML body, when stored.
    pub body_html_path: Option<String>,
    pub size_bytes: u64,
    pub file_count: u32,
    /// Set when quota enforcement dropped bodies/attachments.
    pub truncated: bool,
    pub received_at: DateTime<Utc>,
}

/// A stored header row belonging to a canonical message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// A stored attachment row belonging to a canonical message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageAttachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> Domain {
        Domain {
            id: Uuid::new_v4(),
            name: name.into(),
            policy: DomainPolicy::KnownRecipientsOnly,
        }
    }

    #[test]
    fn domain_owns_address_matches_suffix_case_insensitively() {
        let d = domain("acme.example");
        assert!(d.owns_address("sales@acme.example"));
        assert!(d.owns_address("Sales@ACME.Example"));
        assert!(!d.owns_address("sales@other.example"));
        assert!(!d.owns_address("not-an-address"));
    }

    #[test]
    fn domain_does_not_own_subdomain_addresses() {
        let d = domain("acme.example");
        assert!(!d.owns_address("x@mail.acme.example"));
    }

    #[test]
    fn quota_check_respects_unlimited() {
        let mut mb = Mailbox {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            address: "a@b.c".into(),
            user_id: "u1".into(),
            is_active: true,
            is_archived: false,
            last_message_at: None,
            storage_used_bytes: 900,
            storage_file_count: 3,
            storage_quota_bytes: 0,
        };
        assert!(!mb.would_exceed_quota(u64::MAX / 2));

        mb.storage_quota_bytes = 1000;
        assert!(!mb.would_exceed_quota(100));
        assert!(mb.would_exceed_quota(101));
    }
}
