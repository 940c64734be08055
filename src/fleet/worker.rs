//! Connection worker — owns one IMAP account's session lifecycle.
//!
//! State machine: `idle → connecting → syncing → idle` on the happy path;
//! any state drops to `error` on a connection failure and re-enters
//! `connecting` after a backoff delay; `stopped` is terminal.
//!
//! Steady state is IMAP IDLE when the server supports it (bounded by a
//! max-idle duration that forces a periodic reconnect), fixed-interval
//! polling otherwise. A NOOP heartbeat runs on a fixed interval while
//! connected so a silently dead connection is noticed within bounded time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{ConnectionError, Error, SyncError};
use crate::fleet::backoff::Backoff;
use crate::fleet::session::{self, IdleOutcome, ImapSession, ImapStream};
use crate::fleet::{WorkerSnapshot, WorkerState, WorkerStatus};
use crate::pipeline::types::{BatchStats, IngestContext};
use crate::pipeline::IngestPipeline;
use crate::store::MetadataStore;
use crate::store::models::{DeliveryMode, Domain, ExternalMailbox};

/// Bound on how long `stop()` waits for a graceful drain before aborting
/// the run loop outright.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How the connected steady loop ended.
enum SessionEnd {
    /// `stop()` was requested; the run loop exits.
    Shutdown,
    /// Max-idle elapsed; reconnect without backoff penalty.
    Reconnect,
}

/// One worker per configured external account.
pub struct ConnectionWorker {
    account: ExternalMailbox,
    ctx: IngestContext,
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<IngestPipeline>,
    config: IngestConfig,
    state: Arc<RwLock<WorkerState>>,
    /// Serializes syncs: the steady loop and `trigger_sync` never run two
    /// sync passes concurrently for this account.
    sync_lock: Mutex<()>,
    shutdown: AtomicBool,
    wake: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWorker {
    pub fn new(
        account: ExternalMailbox,
        domain: Domain,
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<IngestPipeline>,
        config: IngestConfig,
    ) -> Self {
        let personal_mailbox_id = match account.mode {
            DeliveryMode::Personal { mailbox_id } => Some(mailbox_id),
            DeliveryMode::CatchAll => None,
        };
        let state = WorkerState::new(domain.name.clone());
        let ctx = IngestContext {
            account_id: account.id,
            domain,
            personal_mailbox_id,
        };
        Self {
            account,
            ctx,
            store,
            pipeline,
            config,
            state: Arc::new(RwLock::new(state)),
            sync_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn account_id(&self) -> uuid::Uuid {
        self.account.id
    }

    /// Pure comparison the manager uses to decide restart-vs-keep. Only
    /// connection-affecting fields participate; poll interval and label
    /// changes must not force a disruptive reconnect.
    pub fn matches_config(&self, candidate: &ExternalMailbox) -> bool {
        connection_fields_match(&self.account, candidate)
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.read().await;
        WorkerSnapshot {
            account_id: self.account.id,
            domain: state.domain_name.clone(),
            status: state.status,
            last_sync_at: state.last_sync_at,
            last_error: state.last_error.clone(),
            consecutive_errors: state.consecutive_errors,
        }
    }

    /// Spawn the run loop.
    pub async fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.run_loop().await;
        });
        *self.handle.lock().await = Some(handle);
        info!(account = %self.account.id, host = %self.account.imap_host, "Worker started");
    }

    /// Request shutdown, abort in-flight protocol work, and wait for the
    /// run loop to exit — bounded even if the remote end is unresponsive.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        if let Some(mut handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!(account = %self.account.id, "Graceful drain timed out; aborting worker");
                handle.abort();
            }
        }

        self.set_status(WorkerStatus::Stopped).await;
        info!(account = %self.account.id, "Worker stopped");
    }

    /// Manual one-shot sync over a dedicated short-lived connection,
    /// serialized with the steady-state loop by the sync lock.
    pub async fn trigger_sync(&self) -> Result<(), Error> {
        if self.is_shutdown() {
            return Err(SyncError::Command("worker is stopped".into()).into());
        }

        if self.account.use_tls {
            let mut session =
                session::connect_tls(&self.account, self.config.connect_timeout).await?;
            let result = self.range_scan(&mut session).await;
            session.logout().await;
            result.map_err(Into::into)
        } else {
            let mut session =
                session::connect_plain(&self.account, self.config.connect_timeout).await?;
            let result = self.range_scan(&mut session).await;
            session.logout().await;
            result.map_err(Into::into)
        }
    }

    // ── Run loop ────────────────────────────────────────────────────

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn set_status(&self, status: WorkerStatus) {
        self.state.write().await.status = status;
    }

    async fn run_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff_floor, self.config.backoff_ceiling);

        while !self.is_shutdown() {
            self.set_status(WorkerStatus::Connecting).await;

            let end = if self.account.use_tls {
                match session::connect_tls(&self.account, self.config.connect_timeout).await {
                    Ok(session) => self.run_connected(session, &mut backoff).await,
                    Err(e) => Err(e.into()),
                }
            } else {
                match session::connect_plain(&self.account, self.config.connect_timeout).await {
                    Ok(session) => self.run_connected(session, &mut backoff).await,
                    Err(e) => Err(e.into()),
                }
            };

            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect) => {
                    debug!(account = %self.account.id, "Max idle reached; reconnecting");
                }
                Err(e) => {
                    self.note_error(&e).await;
                    self.set_status(WorkerStatus::Error).await;
                    let delay = backoff.next();
                    warn!(
                        account = %self.account.id,
                        host = %self.account.imap_host,
                        delay_secs = delay.as_secs(),
                        "Connection failed, backing off: {e}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }

        self.set_status(WorkerStatus::Stopped).await;
    }

    /// Drive one established session: initial authoritative sync, then the
    /// steady state (IDLE or polling) until shutdown, max-idle, or a dead
    /// connection.
    async fn run_connected<S: ImapStream>(
        &self,
        mut session: ImapSession<S>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, Error> {
        // Initial sync. A protocol error aborts only the attempt; the
        // connection stays up and the steady loop takes over.
        match self.range_scan(&mut session).await {
            Ok(()) => backoff.reset(),
            Err(e) => {
                self.note_error(&Error::Sync(e)).await;
                self.set_status(WorkerStatus::Error).await;
            }
        }

        let use_idle = session.supports_idle();
        let connected_at = Instant::now();
        let poll_interval = Duration::from_secs(self.account.poll_interval_secs.max(1));
        let mut next_heartbeat = Instant::now() + self.config.heartbeat_interval;

        debug!(
            account = %self.account.id,
            idle = use_idle,
            poll_secs = poll_interval.as_secs(),
            "Entering steady state"
        );

        loop {
            if self.is_shutdown() {
                session.logout().await;
                return Ok(SessionEnd::Shutdown);
            }
            if connected_at.elapsed() >= self.config.max_idle {
                session.logout().await;
                return Ok(SessionEnd::Reconnect);
            }

            if use_idle {
                let (returned, outcome) = session
                    .idle_wait(self.config.heartbeat_interval)
                    .await
                    .map_err(|e| self.lost(e))?;
                session = returned;

                match outcome {
                    IdleOutcome::NewData => {
                        if let Err(e) = self.unseen_scan(&mut session).await {
                            self.note_error(&Error::Sync(e)).await;
                            self.set_status(WorkerStatus::Error).await;
                        } else {
                            backoff.reset();
                        }
                    }
                    IdleOutcome::Timeout => {
                        // Heartbeat: a dead connection surfaces here.
                        session.noop().await.map_err(|e| self.lost(e))?;
                    }
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = self.wake.notified() => continue,
                }
                if self.is_shutdown() {
                    session.logout().await;
                    return Ok(SessionEnd::Shutdown);
                }

                if Instant::now() >= next_heartbeat {
                    session.noop().await.map_err(|e| self.lost(e))?;
                    next_heartbeat = Instant::now() + self.config.heartbeat_interval;
                }

                if let Err(e) = self.unseen_scan(&mut session).await {
                    self.note_error(&Error::Sync(e)).await;
                    self.set_status(WorkerStatus::Error).await;
                } else {
                    backoff.reset();
                }
            }
        }
    }

    fn lost(&self, e: SyncError) -> Error {
        ConnectionError::Lost {
            host: self.account.imap_host.clone(),
            reason: e.to_string(),
        }
        .into()
    }

    // ── Sync algorithms ─────────────────────────────────────────────

    /// Cheap incremental pass: fetch unread messages, process, mark read.
    async fn unseen_scan<S: ImapStream>(
        &self,
        session: &mut ImapSession<S>,
    ) -> Result<(), SyncError> {
        let _guard = self.sync_lock.lock().await;
        self.set_status(WorkerStatus::Syncing).await;

        session.select_inbox().await?;
        let uids = session.search_unseen().await?;
        if !uids.is_empty() {
            debug!(account = %self.account.id, count = uids.len(), "Unseen scan");
            let stored = self.stored_cursor().await?;
            let max_attempted = self.process_uids(session, &uids).await?;
            if max_attempted > stored.0 {
                self.store
                    .update_sync_cursor(self.account.id, max_attempted, stored.1)
                    .await?;
            }
        }

        self.note_success().await?;
        self.set_status(WorkerStatus::Idle).await;
        Ok(())
    }

    /// Authoritative pass: select INBOX, detect a UIDVALIDITY epoch change
    /// (which resets the cursor to the start of the UID space), then fetch
    /// everything above the cursor.
    async fn range_scan<S: ImapStream>(
        &self,
        session: &mut ImapSession<S>,
    ) -> Result<(), SyncError> {
        let _guard = self.sync_lock.lock().await;
        self.set_status(WorkerStatus::Syncing).await;

        let status = session.select_inbox().await?;
        let (stored_uid, stored_validity) = self.stored_cursor().await?;

        let (cursor, epoch_changed) =
            next_cursor(stored_uid, stored_validity, status.uid_validity);
        if epoch_changed {
            warn!(
                account = %self.account.id,
                old = ?stored_validity,
                new = ?status.uid_validity,
                "UIDVALIDITY changed; rescanning from the start of the UID space"
            );
            self.store
                .update_sync_cursor(self.account.id, 0, status.uid_validity)
                .await?;
        }

        let uids = session.search_uids_above(cursor).await?;
        debug!(
            account = %self.account.id,
            cursor,
            count = uids.len(),
            "Range scan"
        );

        let max_attempted = self.process_uids(session, &uids).await?;
        let new_cursor = cursor.max(max_attempted);
        self.store
            .update_sync_cursor(self.account.id, new_cursor, status.uid_validity)
            .await?;

        self.note_success().await?;
        self.set_status(WorkerStatus::Idle).await;
        Ok(())
    }

    /// Fetch and ingest `uids` in chunks. Every UID in a fetched chunk is
    /// marked \Seen whether or not its message processed cleanly, and the
    /// cursor advances over failures too, so one poison message cannot
    /// stall ingestion forever. Returns the highest UID attempted.
    async fn process_uids<S: ImapStream>(
        &self,
        session: &mut ImapSession<S>,
        uids: &[u32],
    ) -> Result<u32, SyncError> {
        let mut stats = BatchStats::default();
        let mut max_attempted = 0u32;

        for chunk in uids.chunks(self.config.fetch_chunk_size.max(1)) {
            let fetched = session.fetch_raw(chunk).await?;

            for (uid, raw) in &fetched {
                stats.attempted += 1;
                match self.pipeline.ingest(&self.ctx, raw, Some(*uid)).await {
                    Ok(outcome) => {
                        let delivered = outcome.delivered_count();
                        stats.delivered += delivered;
                        if delivered == 0 {
                            stats.duplicates += 1;
                        }
                    }
                    Err(e) => {
                        stats.errors += 1;
                        warn!(
                            account = %self.account.id,
                            uid,
                            "Message failed to ingest (skipped): {e}"
                        );
                    }
                }
            }

            // \Seen goes to every attempted UID, not only successes.
            session.mark_seen(chunk).await?;
            if let Some(&last) = chunk.last() {
                max_attempted = max_attempted.max(last);
            }
        }

        if stats.attempted > 0 {
            info!(
                account = %self.account.id,
                attempted = stats.attempted,
                delivered = stats.delivered,
                duplicates = stats.duplicates,
                errors = stats.errors,
                "Sync batch complete"
            );
        }
        Ok(max_attempted)
    }

    // ── Bookkeeping ─────────────────────────────────────────────────

    /// Current persisted cursor, read fresh so a manual sync's progress is
    /// visible to the steady loop.
    async fn stored_cursor(&self) -> Result<(u32, Option<u32>), SyncError> {
        let account = self
            .store
            .get_external_mailbox(self.account.id)
            .await?;
        Ok(account
            .map(|a| (a.last_synced_uid, a.last_uid_validity))
            .unwrap_or((self.account.last_synced_uid, self.account.last_uid_validity)))
    }

    async fn note_success(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        self.store.record_sync_success(self.account.id, now).await?;
        let mut state = self.state.write().await;
        state.last_sync_at = Some(now);
        state.last_error = None;
        state.consecutive_errors = 0;
        Ok(())
    }

    async fn note_error(&self, e: &Error) {
        let text = e.to_string();
        if let Err(db_err) = self.store.record_sync_error(self.account.id, &text).await {
            warn!(account = %self.account.id, "Failed to persist sync error: {db_err}");
        }
        let mut state = self.state.write().await;
        state.last_error = Some(text);
        state.consecutive_errors += 1;
    }
}

/// Compare only connection-affecting fields.
fn connection_fields_match(a: &ExternalMailbox, b: &ExternalMailbox) -> bool {
    a.imap_host == b.imap_host
        && a.imap_port == b.imap_port
        && a.use_tls == b.use_tls
        && a.username == b.username
        && a.password.expose_secret() == b.password.expose_secret()
}

/// Decide the effective sync cursor given the stored epoch and the one the
/// server just reported. An epoch change invalidates every recorded UID,
/// so the cursor drops back to the start of the UID space.
fn next_cursor(
    stored_uid: u32,
    stored_validity: Option<u32>,
    server_validity: Option<u32>,
) -> (u32, bool) {
    match (stored_validity, server_validity) {
        (Some(old), Some(new)) if old != new => (0, true),
        _ => (stored_uid, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use uuid::Uuid;

    fn account() -> ExternalMailbox {
        ExternalMailbox {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            label: "Acme".into(),
            imap_host: "imap.acme.example".into(),
            imap_port: 993,
            use_tls: true,
            username: "catchall@acme.example".into(),
            password: SecretString::from("hunter2"),
            poll_interval_secs: 60,
            mode: DeliveryMode::CatchAll,
            is_active: true,
            last_synced_uid: 0,
            last_uid_validity: None,
            consecutive_errors: 0,
            last_error: None,
            last_synced_at: None,
        }
    }

    #[test]
    fn matches_config_ignores_poll_interval_and_label() {
        let a = account();
        let mut b = a.clone();
        b.poll_interval_secs = 300;
        b.label = "Renamed".into();
        assert!(connection_fields_match(&a, &b));
    }

    #[test]
    fn matches_config_flags_connection_changes() {
        let a = account();

        let mut b = a.clone();
        b.imap_host = "imap2.acme.example".into();
        assert!(!connection_fields_match(&a, &b));

        let mut b = a.clone();
        b.imap_port = 143;
        assert!(!connection_fields_match(&a, &b));

        let mut b = a.clone();
        b.use_tls = false;
        assert!(!connection_fields_match(&a, &b));

        let mut b = a.clone();
        b.username = "other@acme.example".into();
        assert!(!connection_fields_match(&a, &b));

        let mut b = a.clone();
        b.password = SecretString::from("changed");
        assert!(!connection_fields_match(&a, &b));
    }

    #[test]
    fn cursor_unchanged_while_epoch_stable() {
        assert_eq!(next_cursor(500, Some(7), Some(7)), (500, false));
        assert_eq!(next_cursor(500, None, Some(7)), (500, false));
        assert_eq!(next_cursor(500, Some(7), None), (500, false));
    }

    #[test]
    fn cursor_resets_on_epoch_change() {
        assert_eq!(next_cursor(500, Some(7), Some(8)), (0, true));
    }
}
