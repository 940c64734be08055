//! libSQL backend — async `MetadataStore` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 text; UUIDs as text; recipient lists as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::models::{
    CanonicalMessage, DeliveryMode, Domain, DomainPolicy, ExternalMailbox, InboundAuditRecord,
    Mailbox, MessageAttachment, MessageHeader,
};
use crate::store::traits::{InsertOutcome, MetadataStore};

/// libSQL metadata store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Metadata store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{entity} id: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn policy_to_columns(policy: &DomainPolicy) -> (&'static str, Option<String>) {
    match policy {
        DomainPolicy::KnownRecipientsOnly => ("known_recipients_only", None),
        DomainPolicy::DeliverAll {
            fallback_mailbox_id,
        } => ("deliver_all", fallback_mailbox_id.map(|id| id.to_string())),
    }
}

fn columns_to_policy(policy: &str, fallback: Option<String>) -> DomainPolicy {
    match policy {
        "deliver_all" => DomainPolicy::DeliverAll {
            fallback_mailbox_id: fallback.and_then(|s| Uuid::parse_str(&s).ok()),
        },
        _ => DomainPolicy::KnownRecipientsOnly,
    }
}

fn mode_to_columns(mode: &DeliveryMode) -> (&'static str, Option<String>) {
    match mode {
        DeliveryMode::CatchAll => ("catch_all", None),
        DeliveryMode::Personal { mailbox_id } => ("personal", Some(mailbox_id.to_string())),
    }
}

fn columns_to_mode(mode: &str, target: Option<String>) -> DeliveryMode {
    match (mode, target.and_then(|s| Uuid::parse_str(&s).ok())) {
        ("personal", Some(mailbox_id)) => DeliveryMode::Personal { mailbox_id },
        _ => DeliveryMode::CatchAll,
    }
}

const EXTERNAL_COLUMNS: &str = "id, domain_id, label, imap_host, imap_port, use_tls, username, \
     password, poll_interval_secs, mode, target_mailbox_id, is_active, last_synced_uid, \
     last_uid_validity, consecutive_errors, last_error, last_synced_at";

fn row_to_external(row: &libsql::Row) -> Result<ExternalMailbox, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("external row: {e}")))?;
    let domain_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("external row: {e}")))?;

    Ok(ExternalMailbox {
        id: parse_uuid(&id, "external_mailbox")?,
        domain_id: parse_uuid(&domain_id, "domain")?,
        label: row.get::<String>(2).unwrap_or_default(),
        imap_host: row.get::<String>(3).unwrap_or_default(),
        imap_port: row.get::<i64>(4).unwrap_or(993) as u16,
        use_tls: row.get::<i64>(5).unwrap_or(1) != 0,
        username: row.get::<String>(6).unwrap_or_default(),
        password: SecretString::from(row.get::<String>(7).unwrap_or_default()),
        poll_interval_secs: row.get::<i64>(8).unwrap_or(60) as u64,
        mode: columns_to_mode(
            &row.get::<String>(9).unwrap_or_default(),
            row.get::<String>(10).ok(),
        ),
        is_active: row.get::<i64>(11).unwrap_or(1) != 0,
        last_synced_uid: row.get::<i64>(12).unwrap_or(0) as u32,
        last_uid_validity: row.get::<i64>(13).ok().map(|v| v as u32),
        consecutive_errors: row.get::<i64>(14).unwrap_or(0) as u32,
        last_error: row.get::<String>(15).ok(),
        last_synced_at: row.get::<String>(16).ok().map(|s| parse_datetime(&s)),
    })
}

const MAILBOX_COLUMNS: &str = "id, domain_id, address, user_id, is_active, is_archived, \
     last_message_at, storage_used_bytes, storage_file_count, storage_quota_bytes";

fn row_to_mailbox(row: &libsql::Row) -> Result<Mailbox, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("mailbox row: {e}")))?;
    let domain_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("mailbox row: {e}")))?;

    Ok(Mailbox {
        id: parse_uuid(&id, "mailbox")?,
        domain_id: parse_uuid(&domain_id, "domain")?,
        address: row.get::<String>(2).unwrap_or_default(),
        user_id: row.get::<String>(3).unwrap_or_default(),
        is_active: row.get::<i64>(4).unwrap_or(1) != 0,
        is_archived: row.get::<i64>(5).unwrap_or(0) != 0,
        last_message_at: row.get::<String>(6).ok().map(|s| parse_datetime(&s)),
        storage_used_bytes: row.get::<i64>(7).unwrap_or(0) as u64,
        storage_file_count: row.get::<i64>(8).unwrap_or(0) as u32,
        storage_quota_bytes: row.get::<i64>(9).unwrap_or(0) as u64,
    })
}

const MESSAGE_COLUMNS: &str = "id, mailbox_id, dedup_key, subject, from_addr, to_addrs, \
     body_text_path, body_html_path, size_bytes, file_count, truncated, received_at";

fn row_to_message(row: &libsql::Row) -> Result<CanonicalMessage, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("message row: {e}")))?;
    let mailbox_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("message row: {e}")))?;
    let to_addrs: Vec<String> = row
        .get::<String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(CanonicalMessage {
        id: parse_uuid(&id, "message")?,
        mailbox_id: parse_uuid(&mailbox_id, "mailbox")?,
        dedup_key: row.get::<String>(2).unwrap_or_default(),
        subject: row.get::<String>(3).ok(),
        from_addr: row.get::<String>(4).unwrap_or_default(),
        to_addrs,
        body_text_path: row.get::<String>(6).ok(),
        body_html_path: row.get::<String>(7).ok(),
        size_bytes: row.get::<i64>(8).unwrap_or(0) as u64,
        file_count: row.get::<i64>(9).unwrap_or(0) as u32,
        truncated: row.get::<i64>(10).unwrap_or(0) != 0,
        received_at: parse_datetime(&row.get::<String>(11).unwrap_or_default()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MetadataStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn list_active_external_mailboxes(&self) -> Result<Vec<ExternalMailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXTERNAL_COLUMNS} FROM external_mailboxes WHERE is_active = 1 \
                     ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_external_mailboxes: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_external(&row)?);
        }
        Ok(out)
    }

    async fn get_external_mailbox(
        &self,
        id: Uuid,
    ) -> Result<Option<ExternalMailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXTERNAL_COLUMNS} FROM external_mailboxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_external_mailbox: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_external(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_external_mailbox(
        &self,
        account: &ExternalMailbox,
    ) -> Result<(), DatabaseError> {
        let (mode, target) = mode_to_columns(&account.mode);
        self.conn()
            .execute(
                "INSERT INTO external_mailboxes (id, domain_id, label, imap_host, imap_port, \
                 use_tls, username, password, poll_interval_secs, mode, target_mailbox_id, \
                 is_active, last_synced_uid, last_uid_validity, consecutive_errors, last_error, \
                 last_synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    account.id.to_string(),
                    account.domain_id.to_string(),
                    account.label.clone(),
                    account.imap_host.clone(),
                    i64::from(account.imap_port),
                    i64::from(account.use_tls),
                    account.username.clone(),
                    account.password.expose_secret(),
                    account.poll_interval_secs as i64,
                    mode,
                    opt_text(target.as_deref()),
                    i64::from(account.is_active),
                    i64::from(account.last_synced_uid),
                    opt_i64(account.last_uid_validity.map(i64::from)),
                    i64::from(account.consecutive_errors),
                    opt_text(account.last_error.as_deref()),
                    opt_text(account.last_synced_at.map(|t| t.to_rfc3339()).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_external_mailbox: {e}")))?;
        Ok(())
    }

    async fn update_sync_cursor(
        &self,
        id: Uuid,
        last_synced_uid: u32,
        last_uid_validity: Option<u32>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE external_mailboxes SET last_synced_uid = ?1, last_uid_validity = ?2, \
                 updated_at = ?3 WHERE id = ?4",
                params![
                    i64::from(last_synced_uid),
                    opt_i64(last_uid_validity.map(i64::from)),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_sync_cursor: {e}")))?;

        debug!(account = %id, uid = last_synced_uid, "Sync cursor persisted");
        Ok(())
    }

    async fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE external_mailboxes SET consecutive_errors = 0, last_error = NULL, \
                 last_synced_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_sync_success: {e}")))?;
        Ok(())
    }

    async fn record_sync_error(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE external_mailboxes SET consecutive_errors = consecutive_errors + 1, \
                 last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_sync_error: {e}")))?;
        Ok(())
    }

    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, policy, fallback_mailbox_id FROM domains WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_domain: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(Domain {
                    id: parse_uuid(&id, "domain")?,
                    name: row.get::<String>(1).unwrap_or_default(),
                    policy: columns_to_policy(
                        &row.get::<String>(2).unwrap_or_default(),
                        row.get::<String>(3).ok(),
                    ),
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert_domain(&self, domain: &Domain) -> Result<(), DatabaseError> {
        let (policy, fallback) = policy_to_columns(&domain.policy);
        self.conn()
            .execute(
                "INSERT INTO domains (id, name, policy, fallback_mailbox_id) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    domain.id.to_string(),
                    domain.name.clone(),
                    policy,
                    opt_text(fallback.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_domain: {e}")))?;
        Ok(())
    }

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_mailbox: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_mailbox(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_mailbox_by_address(
        &self,
        domain_id: Uuid,
        address: &str,
    ) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes \
                     WHERE domain_id = ?1 AND address = ?2 COLLATE NOCASE"
                ),
                params![domain_id.to_string(), address.to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_mailbox_by_address: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_mailbox(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mailboxes (id, domain_id, address, user_id, is_active, is_archived, \
                 last_message_at, storage_used_bytes, storage_file_count, storage_quota_bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    mailbox.id.to_string(),
                    mailbox.domain_id.to_string(),
                    mailbox.address.to_lowercase(),
                    mailbox.user_id.clone(),
                    i64::from(mailbox.is_active),
                    i64::from(mailbox.is_archived),
                    opt_text(mailbox.last_message_at.map(|t| t.to_rfc3339()).as_deref()),
                    mailbox.storage_used_bytes as i64,
                    i64::from(mailbox.storage_file_count),
                    mailbox.storage_quota_bytes as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_mailbox: {e}")))?;
        Ok(())
    }

    async fn advance_mailbox_watermark(
        &self,
        mailbox_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // RFC 3339 UTC timestamps compare correctly as text.
        self.conn()
            .execute(
                "UPDATE mailboxes SET last_message_at = ?1 \
                 WHERE id = ?2 AND (last_message_at IS NULL OR last_message_at < ?1)",
                params![at.to_rfc3339(), mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_mailbox_watermark: {e}")))?;
        Ok(())
    }

    async fn add_storage_usage(
        &self,
        mailbox_id: Uuid,
        bytes: u64,
        files: u32,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET storage_used_bytes = storage_used_bytes + ?1, \
                 storage_file_count = storage_file_count + ?2 WHERE id = ?3",
                params![bytes as i64, i64::from(files), mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_storage_usage: {e}")))?;
        Ok(())
    }

    async fn insert_audit_record(
        &self,
        record: &InboundAuditRecord,
    ) -> Result<InsertOutcome, DatabaseError> {
        let recipients = serde_json::to_string(&record.recipients)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let affected = self
            .conn()
            .execute(
                "INSERT INTO inbound_audit (id, dedup_key, domain_id, from_addr, recipients, \
                 subject, received_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (dedup_key, domain_id) DO NOTHING",
                params![
                    record.id.to_string(),
                    record.dedup_key.clone(),
                    record.domain_id.to_string(),
                    record.from_addr.clone(),
                    recipients,
                    opt_text(record.subject.as_deref()),
                    record.received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_audit_record: {e}")))?;

        if affected == 0 {
            Ok(InsertOutcome::AlreadyRecorded)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn canonical_exists(
        &self,
        dedup_key: &str,
        mailbox_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM messages WHERE dedup_key = ?1 AND mailbox_id = ?2",
                params![dedup_key, mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("canonical_exists: {e}")))?;

        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .is_some())
    }

    async fn insert_canonical_message(
        &self,
        message: &CanonicalMessage,
        headers: &[MessageHeader],
        attachments: &[MessageAttachment],
    ) -> Result<InsertOutcome, DatabaseError> {
        let to_addrs = serde_json::to_string(&message.to_addrs)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))?;

        let insert = tx
            .execute(
                "INSERT INTO messages (id, mailbox_id, dedup_key, subject, from_addr, to_addrs, \
                 body_text_path, body_html_path, size_bytes, file_count, truncated, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id.to_string(),
                    message.mailbox_id.to_string(),
                    message.dedup_key.clone(),
                    opt_text(message.subject.as_deref()),
                    message.from_addr.clone(),
                    to_addrs,
                    opt_text(message.body_text_path.as_deref()),
                    opt_text(message.body_html_path.as_deref()),
                    message.size_bytes as i64,
                    i64::from(message.file_count),
                    i64::from(message.truncated),
                    message.received_at.to_rfc3339(),
                ],
            )
            .await;

        if let Err(e) = insert {
            let err = DatabaseError::Query(format!("insert_canonical_message: {e}"));
            let _ = tx.rollback().await;
            if err.is_unique_violation() {
                debug!(dedup_key = %message.dedup_key, mailbox = %message.mailbox_id,
                    "Canonical message already recorded");
                return Ok(InsertOutcome::AlreadyRecorded);
            }
            return Err(err);
        }

        for header in headers {
            if let Err(e) = tx
                .execute(
                    "INSERT INTO message_headers (message_id, name, value) VALUES (?1, ?2, ?3)",
                    params![
                        message.id.to_string(),
                        header.name.clone(),
                        header.value.clone()
                    ],
                )
                .await
            {
                let _ = tx.rollback().await;
                return Err(DatabaseError::Query(format!("insert header: {e}")));
            }
        }

        for attachment in attachments {
            if let Err(e) = tx
                .execute(
                    "INSERT INTO attachments (message_id, filename, content_type, size_bytes, \
                     path) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        message.id.to_string(),
                        attachment.filename.clone(),
                        attachment.content_type.clone(),
                        attachment.size_bytes as i64,
                        attachment.path.clone()
                    ],
                )
                .await
            {
                let _ = tx.rollback().await;
                return Err(DatabaseError::Query(format!("insert attachment: {e}")));
            }
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit canonical message: {e}")))?;

        debug!(message = %message.id, mailbox = %message.mailbox_id, "Canonical message stored");
        Ok(InsertOutcome::Inserted)
    }

    async fn get_canonical_message(
        &self,
        dedup_key: &str,
        mailbox_id: Uuid,
    ) -> Result<Option<CanonicalMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE dedup_key = ?1 AND mailbox_id = ?2"
                ),
                params![dedup_key, mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_canonical_message: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_canonical_messages(&self, mailbox_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE mailbox_id = ?1",
                params![mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_canonical_messages: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }
}
