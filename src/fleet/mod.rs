//! Connection fleet: one worker per external account, reconciled by the
//! manager.

pub mod backoff;
pub mod manager;
pub mod session;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use manager::FleetManager;
pub use worker::ConnectionWorker;

/// Lifecycle state of one connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Connecting,
    Syncing,
    Error,
    Stopped,
}

/// In-memory worker state. Not persisted; rebuilt from scratch by manager
/// reconciliation after a restart.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub domain_name: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
}

impl WorkerState {
    pub fn new(domain_name: String) -> Self {
        Self {
            status: WorkerStatus::Idle,
            domain_name,
            last_sync_at: None,
            last_error: None,
            consecutive_errors: 0,
        }
    }
}

/// Serializable snapshot of one worker for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub account_id: Uuid,
    pub domain: String,
    pub status: WorkerStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
}
