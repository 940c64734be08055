//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "ingestion_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS domains (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            policy TEXT NOT NULL DEFAULT 'known_recipients_only',
            fallback_mailbox_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS mailboxes (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL REFERENCES domains(id),
            address TEXT NOT NULL,
            user_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_archived INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT,
            storage_used_bytes INTEGER NOT NULL DEFAULT 0,
            storage_file_count INTEGER NOT NULL DEFAULT 0,
            storage_quota_bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (domain_id, address)
        );
        CREATE INDEX IF NOT EXISTS idx_mailboxes_domain ON mailboxes(domain_id);

        CREATE TABLE IF NOT EXISTS external_mailboxes (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL REFERENCES domains(id),
            label TEXT NOT NULL DEFAULT '',
            imap_host TEXT NOT NULL,
            imap_port INTEGER NOT NULL DEFAULT 993,
            use_tls INTEGER NOT NULL DEFAULT 1,
            username TEXT NOT NULL,
            password TEXT NOT NULL,
            poll_interval_secs INTEGER NOT NULL DEFAULT 60,
            mode TEXT NOT NULL DEFAULT 'catch_all',
            target_mailbox_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_synced_uid INTEGER NOT NULL DEFAULT 0,
            last_uid_validity INTEGER,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_synced_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_external_mailboxes_active
            ON external_mailboxes(is_active);

        CREATE TABLE IF NOT EXISTS inbound_audit (
            id TEXT PRIMARY KEY,
            dedup_key TEXT NOT NULL,
            domain_id TEXT NOT NULL REFERENCES domains(id),
            from_addr TEXT NOT NULL,
            recipients TEXT NOT NULL DEFAULT '[]',
            subject TEXT,
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (dedup_key, domain_id)
        );
        CREATE INDEX IF NOT EXISTS idx_inbound_audit_domain ON inbound_audit(domain_id);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            mailbox_id TEXT NOT NULL REFERENCES mailboxes(id),
            dedup_key TEXT NOT NULL,
            subject TEXT,
            from_addr TEXT NOT NULL,
            to_addrs TEXT NOT NULL DEFAULT '[]',
            body_text_path TEXT,
            body_html_path TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            truncated INTEGER NOT NULL DEFAULT 0,
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (dedup_key, mailbox_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_mailbox ON messages(mailbox_id);

        CREATE TABLE IF NOT EXISTS message_headers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            value TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_message_headers_message
            ON message_headers(message_id);

        CREATE TABLE IF NOT EXISTS attachments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            path TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
    "#,
}];

/// Apply all migrations newer than the recorded schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("creating _migrations table: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "applying migration {} ({}): {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "recording migration {}: {e}",
                migration.version
            ))
        })?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
