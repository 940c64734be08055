//! Recurring task scheduler.
//!
//! Each registered task gets its own ticker loop. Two invocations of the
//! same task name never run concurrently: a tick that arrives while the
//! previous run is still going is skipped, not queued. A handler failure
//! or panic is confined to that run — the ticker keeps going and other
//! tasks are unaffected.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct ScheduledTask {
    handle: JoinHandle<()>,
    last_run: Arc<RwLock<Option<DateTime<Utc>>>>,
}

/// Fires named recurring tasks at independent intervals.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recurring task. Replaces any existing task with the same
    /// name, cancelling its ticker.
    pub async fn schedule<F>(&self, name: &str, interval: Duration, handler: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let handler: TaskHandler = Arc::new(handler);
        let running = Arc::new(AtomicBool::new(false));
        let last_run = Arc::new(RwLock::new(None));

        let task_name = name.to_string();
        let last_run_clone = Arc::clone(&last_run);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // First tick fires immediately; skip it so a freshly scheduled
            // task waits one full interval.
            tick.tick().await;

            loop {
                tick.tick().await;

                if running.swap(true, Ordering::SeqCst) {
                    debug!(task = %task_name, "Previous run still in progress; skipping tick");
                    continue;
                }

                *last_run_clone.write().await = Some(Utc::now());

                // Run in a separate task so a panicking handler cannot take
                // the ticker loop down with it.
                let handler = Arc::clone(&handler);
                let run_name = task_name.clone();
                let run_flag = Arc::clone(&running);
                tokio::spawn(async move {
                    let result =
                        tokio::spawn(async move { handler().await }).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(task = %run_name, "Task failed: {e}"),
                        Err(e) => error!(task = %run_name, "Task panicked: {e}"),
                    }
                    run_flag.store(false, Ordering::SeqCst);
                });
            }
        });

        let mut tasks = self.tasks.write().await;
        if let Some(previous) = tasks.insert(
            name.to_string(),
            ScheduledTask { handle, last_run },
        ) {
            warn!(task = %name, "Replacing existing scheduled task");
            previous.handle.abort();
        }
    }

    /// Last-run timestamps for every registered task.
    pub async fn last_runs(&self) -> HashMap<String, Option<DateTime<Utc>>> {
        let tasks = self.tasks.read().await;
        let mut out = HashMap::with_capacity(tasks.len());
        for (name, task) in tasks.iter() {
            out.insert(name.clone(), *task.last_run.read().await);
        }
        out
    }

    /// Cancel all tickers. In-flight handler runs are left to finish.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.write().await;
        for (name, task) in tasks.drain() {
            debug!(task = %name, "Stopping scheduled task");
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn boxed<F>(fut: F) -> TaskFuture
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Box::pin(fut)
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_are_skipped_not_queued() {
        let scheduler = TaskScheduler::new();
        let starts = Arc::new(AtomicUsize::new(0));

        let starts_clone = Arc::clone(&starts);
        scheduler
            .schedule("slow", Duration::from_millis(10), move || {
                let starts = Arc::clone(&starts_clone);
                boxed(async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    // Longer than three tick intervals.
                    tokio::time::sleep(Duration::from_millis(35)).await;
                    Ok(())
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(45)).await;
        scheduler.stop().await;

        // Ticks at 10/20/30/40ms; the run started at 10ms holds the flag
        // until 45ms, so only the first tick starts a run.
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_keeps_ticking_and_others_unaffected() {
        let scheduler = TaskScheduler::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));

        let failures_clone = Arc::clone(&failures);
        scheduler
            .schedule("failing", Duration::from_millis(10), move || {
                let failures = Arc::clone(&failures_clone);
                boxed(async move {
                    failures.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                })
            })
            .await;

        let successes_clone = Arc::clone(&successes);
        scheduler
            .schedule("healthy", Duration::from_millis(10), move || {
                let successes = Arc::clone(&successes_clone);
                boxed(async move {
                    successes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(55)).await;
        scheduler.stop().await;

        assert!(failures.load(Ordering::SeqCst) >= 3);
        assert!(successes.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_tickers() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_clone = Arc::clone(&runs);
        scheduler
            .schedule("t", Duration::from_millis(10), move || {
                let runs = Arc::clone(&runs_clone);
                boxed(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        scheduler.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn last_runs_are_tracked() {
        let scheduler = TaskScheduler::new();
        scheduler
            .schedule("tracked", Duration::from_millis(10), || boxed(async { Ok(()) }))
            .await;

        assert_eq!(scheduler.last_runs().await["tracked"], None);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(scheduler.last_runs().await["tracked"].is_some());

        scheduler.stop().await;
    }
}
