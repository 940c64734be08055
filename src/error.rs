//! Error types for mailroom.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this error is a unique-constraint conflict.
    ///
    /// Audit and canonical inserts treat a conflict as "already recorded",
    /// never as a failure.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DatabaseError::Constraint(_) => true,
            DatabaseError::Query(msg) => msg.contains("UNIQUE constraint failed"),
            _ => false,
        }
    }
}

/// Errors establishing or keeping an IMAP connection.
///
/// All of these put the worker into the error state and trigger a
/// backoff + reconnect; none of them crash the fleet.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("TCP connect to {host}:{port} failed: {reason}")]
    Tcp {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("Authentication failed for {username} on {host}: {reason}")]
    Auth {
        host: String,
        username: String,
        reason: String,
    },

    #[error("Connect to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("Connection to {host} lost: {reason}")]
    Lost { host: String, reason: String },
}

/// Protocol-level errors during a single sync attempt.
///
/// These abort only the attempt; the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("IMAP command failed: {0}")]
    Command(String),

    #[error("SELECT of {mailbox} failed: {reason}")]
    Select { mailbox: String, reason: String },

    #[error("Another sync is already running on this connection")]
    Busy,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<async_imap::error::Error> for SyncError {
    fn from(e: async_imap::error::Error) -> Self {
        SyncError::Command(e.to_string())
    }
}

/// Pipeline errors for a single message.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Message could not be parsed as MIME")]
    Parse,

    #[error("No recipient could be resolved")]
    NoRecipients,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Storage provider errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Write to {path} failed: {reason}")]
    Write { path: String, reason: String },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_detected_from_constraint() {
        let e = DatabaseError::Constraint("UNIQUE constraint failed: inbound_audit".into());
        assert!(e.is_unique_violation());
    }

    #[test]
    fn unique_violation_detected_from_query_message() {
        let e = DatabaseError::Query("SQLite error: UNIQUE constraint failed: messages".into());
        assert!(e.is_unique_violation());
    }

    #[test]
    fn other_errors_are_not_unique_violations() {
        let e = DatabaseError::Query("no such table: messages".into());
        assert!(!e.is_unique_violation());
        let e = DatabaseError::Pool("closed".into());
        assert!(!e.is_unique_violation());
    }
}
