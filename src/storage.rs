//! Storage provider contract for raw bodies and attachments.
//!
//! The pipeline depends only on this trait, never on a concrete backend.
//! Paths are derived deterministically from the message id and date, so a
//! retried delivery overwrites the same object instead of leaking copies.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use crate::error::StorageError;

/// Writes raw message bodies and attachments somewhere durable.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store `bytes` at `path`. Returns the path the object is reachable
    /// under (usually `path` itself).
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError>;
}

/// Deterministic object path for a message part.
///
/// Layout: `<yyyy>/<mm>/<dd>/<message-id>/<part>`.
pub fn object_path(message_id: Uuid, received_at: DateTime<Utc>, part: &str) -> String {
    format!(
        "{:04}/{:02}/{:02}/{}/{}",
        received_at.year(),
        received_at.month(),
        received_at.day(),
        message_id,
        part
    )
}

/// Sanitize an attachment filename for use as a path segment.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Local-filesystem storage backend.
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageProvider for LocalFsStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        if path.split('/').any(|seg| seg == "..") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Write {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
        }

        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| StorageError::Write {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn object_path_is_deterministic() {
        let id = Uuid::parse_str("6f2a7e9e-1a89-4b2e-9d3a-111111111111").unwrap();
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 12, 30, 0).unwrap();
        let a = object_path(id, at, "body.txt");
        let b = object_path(id, at, "body.txt");
        assert_eq!(a, b);
        assert_eq!(
            a,
            "2025/03/07/6f2a7e9e-1a89-4b2e-9d3a-111111111111/body.txt"
        );
    }

    #[test]
    fn safe_filename_strips_path_separators() {
        assert_eq!(safe_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(safe_filename("report Q3.pdf"), "report_Q3.pdf");
        assert_eq!(safe_filename(""), "attachment");
    }

    #[tokio::test]
    async fn local_fs_writes_and_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path());

        let stored = storage.write("2025/01/01/x/body.txt", b"hello").await.unwrap();
        assert_eq!(stored, "2025/01/01/x/body.txt");

        let on_disk = std::fs::read(dir.path().join("2025/01/01/x/body.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
    }

    #[tokio::test]
    async fn local_fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        let err = storage.write("a/../../b", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
