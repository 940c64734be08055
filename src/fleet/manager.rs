//! Fleet manager — reconciles live workers against desired configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::fleet::worker::ConnectionWorker;
use crate::fleet::WorkerSnapshot;
use crate::pipeline::IngestPipeline;
use crate::scheduler::TaskScheduler;
use crate::store::MetadataStore;

/// Read-only fleet snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub started_at: DateTime<Utc>,
    pub workers: Vec<WorkerSnapshot>,
    pub tasks: HashMap<String, Option<DateTime<Utc>>>,
}

/// Per-account result of an administrative sync trigger.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub account_id: Uuid,
    pub ok: bool,
    pub error: Option<String>,
}

/// Owns 0..N connection workers and the periodic tasks that drive them.
pub struct FleetManager {
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<IngestPipeline>,
    config: IngestConfig,
    scheduler: TaskScheduler,
    workers: tokio::sync::RwLock<HashMap<Uuid, Arc<ConnectionWorker>>>,
    reconciling: AtomicBool,
    stopped: AtomicBool,
    started_at: DateTime<Utc>,
}

impl FleetManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<IngestPipeline>,
        config: IngestConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pipeline,
            config,
            scheduler: TaskScheduler::new(),
            workers: tokio::sync::RwLock::new(HashMap::new()),
            reconciling: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    /// Run an immediate reconcile and schedule the periodic tasks.
    pub async fn start(self: &Arc<Self>) {
        info!("Fleet manager starting");
        self.reconcile().await;

        let manager = Arc::clone(self);
        self.scheduler
            .schedule("reconcile", self.config.reconcile_interval, move || {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    manager.reconcile().await;
                    Ok(())
                })
            })
            .await;

        let manager = Arc::clone(self);
        self.scheduler
            .schedule("full-resync-all", self.config.full_sync_interval, move || {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    manager.sync_all().await;
                    Ok(())
                })
            })
            .await;

        let manager = Arc::clone(self);
        self.scheduler
            .schedule(
                "health-check",
                self.config.health_check_interval,
                move || {
                    let manager = Arc::clone(&manager);
                    Box::pin(async move {
                        manager.health_check().await;
                        Ok(())
                    })
                },
            )
            .await;
    }

    /// Reconcile live workers against the desired account set.
    ///
    /// Single-flight fleet-wide: a call while a run is in progress no-ops.
    /// A metadata-store read failure leaves the previous worker set intact.
    pub async fn reconcile(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.reconciling.swap(true, Ordering::SeqCst) {
            debug!("Reconcile already in progress; skipping");
            return;
        }

        self.reconcile_inner().await;
        self.reconciling.store(false, Ordering::SeqCst);
    }

    async fn reconcile_inner(&self) {
        let desired = match self.store.list_active_external_mailboxes().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Reconcile aborted, keeping current workers: {e}");
                return;
            }
        };
        let desired_ids: Vec<Uuid> = desired.iter().map(|a| a.id).collect();

        // Stop workers that are no longer desired or whose connection
        // parameters changed.
        let mut to_stop: Vec<Arc<ConnectionWorker>> = Vec::new();
        {
            let mut workers = self.workers.write().await;
            let mut keep = HashMap::with_capacity(workers.len());
            for (id, worker) in workers.drain() {
                match desired.iter().find(|a| a.id == id) {
                    Some(account) if worker.matches_config(account) => {
                        keep.insert(id, worker);
                    }
                    Some(_) => {
                        info!(account = %id, "Connection parameters changed; restarting worker");
                        to_stop.push(worker);
                    }
                    None => {
                        info!(account = %id, "Account no longer active; stopping worker");
                        to_stop.push(worker);
                    }
                }
            }
            *workers = keep;
        }
        for worker in to_stop {
            worker.stop().await;
        }

        // Start workers for desired accounts that lack one.
        for account in desired {
            let exists = self.workers.read().await.contains_key(&account.id);
            if exists {
                continue;
            }

            let domain = match self.store.get_domain(account.domain_id).await {
                Ok(Some(domain)) => domain,
                Ok(None) => {
                    warn!(account = %account.id, domain = %account.domain_id,
                        "Account references a missing domain; skipping");
                    continue;
                }
                Err(e) => {
                    error!(account = %account.id, "Failed to load domain: {e}");
                    continue;
                }
            };

            let account_id = account.id;
            let worker = Arc::new(ConnectionWorker::new(
                account,
                domain,
                Arc::clone(&self.store),
                Arc::clone(&self.pipeline),
                self.config.clone(),
            ));
            worker.start().await;
            self.workers.write().await.insert(account_id, worker);
        }

        let count = self.workers.read().await.len();
        debug!(workers = count, desired = desired_ids.len(), "Reconcile complete");
    }

    /// Trigger a manual sync for one account. Reported, not thrown.
    pub async fn sync_account(&self, id: Uuid) -> SyncReport {
        let worker = self.workers.read().await.get(&id).cloned();
        match worker {
            Some(worker) => match worker.trigger_sync().await {
                Ok(()) => SyncReport {
                    account_id: id,
                    ok: true,
                    error: None,
                },
                Err(e) => SyncReport {
                    account_id: id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            },
            None => SyncReport {
                account_id: id,
                ok: false,
                error: Some("no worker for this account".into()),
            },
        }
    }

    /// Trigger a manual sync on every worker. One account's failure never
    /// aborts the others; results are reported per account.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        if self.stopped.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let workers: Vec<Arc<ConnectionWorker>> =
            self.workers.read().await.values().cloned().collect();

        let mut reports = Vec::with_capacity(workers.len());
        for worker in workers {
            let id = worker.account_id();
            let report = match worker.trigger_sync().await {
                Ok(()) => SyncReport {
                    account_id: id,
                    ok: true,
                    error: None,
                },
                Err(e) => {
                    warn!(account = %id, "Manual sync failed: {e}");
                    SyncReport {
                        account_id: id,
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Log accounts that look unhealthy. The status endpoint carries the
    /// same data; this sweep just makes flapping accounts visible in logs.
    async fn health_check(&self) {
        let workers: Vec<Arc<ConnectionWorker>> =
            self.workers.read().await.values().cloned().collect();
        for worker in workers {
            let snapshot = worker.snapshot().await;
            if snapshot.consecutive_errors > 0 {
                warn!(
                    account = %snapshot.account_id,
                    domain = %snapshot.domain,
                    consecutive_errors = snapshot.consecutive_errors,
                    last_error = snapshot.last_error.as_deref().unwrap_or("-"),
                    "Account needs attention"
                );
            }
        }
    }

    /// Read-only snapshot: start time, worker states, task last-run times.
    pub async fn status(&self) -> FleetStatus {
        let workers_guard = self.workers.read().await;
        let mut workers = Vec::with_capacity(workers_guard.len());
        for worker in workers_guard.values() {
            workers.push(worker.snapshot().await);
        }
        drop(workers_guard);
        workers.sort_by_key(|w| w.account_id);

        FleetStatus {
            started_at: self.started_at,
            workers,
            tasks: self.scheduler.last_runs().await,
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Graceful drain: no new reconciles, scheduler stopped, then all
    /// workers stopped concurrently.
    pub async fn stop(&self) {
        info!("Fleet manager stopping");
        self.stopped.store(true, Ordering::SeqCst);
        self.scheduler.stop().await;

        let workers: Vec<Arc<ConnectionWorker>> =
            self.workers.write().await.drain().map(|(_, w)| w).collect();
        futures::future::join_all(workers.iter().map(|w| w.stop())).await;

        info!("Fleet manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{LoggingAutomation, NoopPublisher};
    use crate::pipeline::ParseLimits;
    use crate::storage::LocalFsStorage;
    use crate::store::LibSqlStore;
    use crate::store::models::{DeliveryMode, Domain, DomainPolicy, ExternalMailbox};
    use secrecy::SecretString;

    async fn setup() -> (Arc<LibSqlStore>, Arc<FleetManager>, Domain) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            Arc::new(LocalFsStorage::new(dir.keep())),
            Arc::new(NoopPublisher),
            Arc::new(LoggingAutomation),
            ParseLimits {
                max_headers: 100,
                max_header_value_len: 2048,
                max_attachment_bytes: 10 * 1024 * 1024,
            },
        ));

        let domain = Domain {
            id: Uuid::new_v4(),
            name: "acme.example".into(),
            policy: DomainPolicy::KnownRecipientsOnly,
        };
        store.insert_domain(&domain).await.unwrap();

        // Backoff floor high enough that workers connecting to an unused
        // port sit quietly in their backoff during the test.
        let config = IngestConfig {
            backoff_floor: std::time::Duration::from_secs(600),
            backoff_ceiling: std::time::Duration::from_secs(600),
            connect_timeout: std::time::Duration::from_millis(200),
            ..IngestConfig::default()
        };

        let manager = FleetManager::new(
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            pipeline,
            config,
        );
        (store, manager, domain)
    }

    fn account(domain_id: Uuid, host: &str) -> ExternalMailbox {
        ExternalMailbox {
            id: Uuid::new_v4(),
            domain_id,
            label: "test".into(),
            imap_host: host.into(),
            // An unroutable port; workers fail fast and back off.
            imap_port: 1,
            use_tls: false,
            username: "user".into(),
            password: SecretString::from("pw"),
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

    #[tokio::test]
    async fn reconcile_starts_and_removes_workers() {
        let (store, manager, domain) = setup().await;

        let a = account(domain.id, "127.0.0.1");
        store.insert_external_mailbox(&a).await.unwrap();

        manager.reconcile().await;
        assert_eq!(manager.worker_count().await, 1);

        // Reconcile again: stable set, no duplicates.
        manager.reconcile().await;
        assert_eq!(manager.worker_count().await, 1);

        manager.stop().await;
        assert_eq!(manager.worker_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_reconcile_is_single_flight() {
        let (store, manager, domain) = setup().await;
        let a = account(domain.id, "127.0.0.1");
        store.insert_external_mailbox(&a).await.unwrap();

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        tokio::join!(m1.reconcile(), m2.reconcile());

        // Never two workers for one account.
        assert_eq!(manager.worker_count().await, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn sync_account_reports_missing_worker() {
        let (_store, manager, _domain) = setup().await;
        let report = manager.sync_account(Uuid::new_v4()).await;
        assert!(!report.ok);
        assert!(report.error.is_some());
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_makes_reconcile_a_noop() {
        let (store, manager, domain) = setup().await;
        manager.stop().await;

        let a = account(domain.id, "127.0.0.1");
        store.insert_external_mailbox(&a).await.unwrap();
        manager.reconcile().await;
        assert_eq!(manager.worker_count().await, 0);
    }

    #[tokio::test]
    async fn status_reflects_workers_and_tasks() {
        let (store, manager, domain) = setup().await;
        let a = account(domain.id, "127.0.0.1");
        store.insert_external_mailbox(&a).await.unwrap();

        manager.reconcile().await;
        let status = manager.status().await;
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers[0].account_id, a.id);
        assert_eq!(status.workers[0].domain, "acme.example");

        manager.stop().await;
    }
}
