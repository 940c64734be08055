//! Best-effort side-effect collaborators: realtime push and automation
//! triggers.
//!
//! Both are fire-and-forget from the pipeline's point of view: failures are
//! logged and never block or fail a delivery.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::models::{CanonicalMessage, Mailbox};

/// Publishes realtime events to the owning user's dashboard session.
#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    /// Best-effort publish; implementations log failures internally.
    async fn publish(&self, user_id: &str, event: Value);
}

/// Evaluates user-defined automations against a freshly delivered message.
///
/// The automation *editor* lives elsewhere; this is the trigger interface
/// the pipeline invokes. Errors are logged only.
#[async_trait]
pub trait AutomationTrigger: Send + Sync {
    async fn on_message(&self, message: &CanonicalMessage, mailbox: &Mailbox, user_id: &str);
}

// ── Webhook publisher ───────────────────────────────────────────────

/// Configuration for the webhook publisher.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct WebhookConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl WebhookConfig {
    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Cached HTTP client tagged with the config fingerprint it was built from.
struct CachedClient {
    client: reqwest::Client,
    fingerprint: u64,
}

/// POSTs realtime events to a configured webhook endpoint.
///
/// The HTTP client is an explicitly owned, lazily-initialized handle: it is
/// built on first use and rebuilt whenever the configuration fingerprint
/// changes, never stored as ambient global state.
pub struct WebhookPublisher {
    config: Mutex<WebhookConfig>,
    cached: Mutex<Option<CachedClient>>,
}

impl WebhookPublisher {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config: Mutex::new(config),
            cached: Mutex::new(None),
        }
    }

    /// Swap in new configuration. The cached client is invalidated lazily,
    /// on the next publish.
    pub async fn reconfigure(&self, config: WebhookConfig) {
        *self.config.lock().await = config;
    }

    async fn client(&self) -> Result<(reqwest::Client, String), reqwest::Error> {
        let config = self.config.lock().await.clone();
        let fingerprint = config.fingerprint();

        let mut cached = self.cached.lock().await;
        if let Some(ref entry) = *cached
            && entry.fingerprint == fingerprint
        {
            return Ok((entry.client.clone(), config.endpoint));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        *cached = Some(CachedClient {
            client: client.clone(),
            fingerprint,
        });
        debug!(endpoint = %config.endpoint, "Webhook client (re)built");
        Ok((client, config.endpoint))
    }
}

#[async_trait]
impl RealtimePublisher for WebhookPublisher {
    async fn publish(&self, user_id: &str, event: Value) {
        let (client, endpoint) = match self.client().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(user = %user_id, "Failed to build webhook client: {e}");
                return;
            }
        };

        let body = serde_json::json!({ "user_id": user_id, "event": event });
        match client.post(&endpoint).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(user = %user_id, "Realtime event published");
            }
            Ok(resp) => {
                warn!(user = %user_id, status = %resp.status(), "Realtime publish rejected");
            }
            Err(e) => {
                warn!(user = %user_id, "Realtime publish failed: {e}");
            }
        }
    }
}

/// Publisher that drops events. Used when no webhook is configured, and in
/// tests.
pub struct NoopPublisher;

#[async_trait]
impl RealtimePublisher for NoopPublisher {
    async fn publish(&self, user_id: &str, _event: Value) {
        debug!(user = %user_id, "Realtime publish skipped (no publisher configured)");
    }
}

/// Automation trigger that only logs. Stands in until the automation
/// evaluator collaborator is wired up.
pub struct LoggingAutomation;

#[async_trait]
impl AutomationTrigger for LoggingAutomation {
    async fn on_message(&self, message: &CanonicalMessage, mailbox: &Mailbox, user_id: &str) {
        debug!(
            message = %message.id,
            mailbox = %mailbox.address,
            user = %user_id,
            "Automation trigger invoked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_with_endpoint() {
        let a = WebhookConfig {
            endpoint: "http://localhost:9000/events".into(),
            timeout_secs: 5,
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.endpoint = "http://localhost:9001/events".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[tokio::test]
    async fn reconfigure_invalidates_cached_client() {
        let publisher = WebhookPublisher::new(WebhookConfig {
            endpoint: "http://localhost:9000/events".into(),
            timeout_secs: 5,
        });

        let (_, endpoint) = publisher.client().await.unwrap();
        assert_eq!(endpoint, "http://localhost:9000/events");
        let first_fp = publisher.cached.lock().await.as_ref().unwrap().fingerprint;

        publisher
            .reconfigure(WebhookConfig {
                endpoint: "http://localhost:9001/events".into(),
                timeout_secs: 5,
            })
            .await;

        let (_, endpoint) = publisher.client().await.unwrap();
        assert_eq!(endpoint, "http://localhost:9001/events");
        let second_fp = publisher.cached.lock().await.as_ref().unwrap().fingerprint;
        assert_ne!(first_fp, second_fp);
    }
}
