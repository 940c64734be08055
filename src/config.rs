//! Service configuration, built from environment variables.

use std::time::Duration;

/// Ingestion service configuration.
///
/// Connection parameters for individual external mailboxes live in the
/// metadata store; this covers the knobs that apply fleet-wide.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How often the manager reconciles live workers against desired config.
    pub reconcile_interval: Duration,
    /// How often every worker is forced through an authoritative range-scan.
    pub full_sync_interval: Duration,
    /// How often worker health counters are swept for logging.
    pub health_check_interval: Duration,
    /// Default poll interval for accounts that do not set their own.
    pub default_poll_interval: Duration,
    /// Maximum time a connection may sit in IDLE before a forced reconnect.
    pub max_idle: Duration,
    /// Interval between NOOP heartbeats while connected.
    pub heartbeat_interval: Duration,
    /// Reconnect backoff floor.
    pub backoff_floor: Duration,
    /// Reconnect backoff ceiling.
    pub backoff_ceiling: Duration,
    /// Timeout for connect/login and for graceful worker shutdown.
    pub connect_timeout: Duration,
    /// Messages fetched per IMAP FETCH command.
    pub fetch_chunk_size: usize,
    /// Maximum number of headers kept per message.
    pub max_headers: usize,
    /// Maximum length of a single stored header value.
    pub max_header_value_len: usize,
    /// Attachments above this size are skipped and logged, not stored.
    pub max_attachment_bytes: usize,
    /// Bind address for the admin HTTP surface.
    pub http_port: u16,
    /// Optional webhook endpoint for realtime events.
    pub realtime_webhook_url: Option<String>,
    /// Enable debug logging.
    pub debug: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            full_sync_interval: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            default_poll_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(25 * 60),
            heartbeat_interval: Duration::from_secs(60),
            backoff_floor: Duration::from_secs(5),
            backoff_ceiling: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            fetch_chunk_size: 200,
            max_headers: 100,
            max_header_value_len: 2048,
            max_attachment_bytes: 10 * 1024 * 1024,
            http_port: 8025,
            realtime_webhook_url: None,
            debug: false,
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(default, Duration::from_secs)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let http_port: u16 = std::env::var("MAILROOM_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.http_port);

        let debug = std::env::var("MAILROOM_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            reconcile_interval: env_secs("MAILROOM_RECONCILE_SECS", defaults.reconcile_interval),
            full_sync_interval: env_secs("MAILROOM_FULL_SYNC_SECS", defaults.full_sync_interval),
            health_check_interval: env_secs(
                "MAILROOM_HEALTH_CHECK_SECS",
                defaults.health_check_interval,
            ),
            default_poll_interval: env_secs("MAILROOM_POLL_SECS", defaults.default_poll_interval),
            max_idle: env_secs("MAILROOM_MAX_IDLE_SECS", defaults.max_idle),
            heartbeat_interval: env_secs("MAILROOM_HEARTBEAT_SECS", defaults.heartbeat_interval),
            backoff_floor: env_secs("MAILROOM_BACKOFF_FLOOR_SECS", defaults.backoff_floor),
            backoff_ceiling: env_secs("MAILROOM_BACKOFF_CEILING_SECS", defaults.backoff_ceiling),
            connect_timeout: env_secs("MAILROOM_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            fetch_chunk_size: env_usize("MAILROOM_FETCH_CHUNK", defaults.fetch_chunk_size),
            max_headers: env_usize("MAILROOM_MAX_HEADERS", defaults.max_headers),
            max_header_value_len: env_usize(
                "MAILROOM_MAX_HEADER_VALUE_LEN",
                defaults.max_header_value_len,
            ),
            max_attachment_bytes: env_usize(
                "MAILROOM_MAX_ATTACHMENT_BYTES",
                defaults.max_attachment_bytes,
            ),
            http_port,
            realtime_webhook_url: std::env::var("MAILROOM_REALTIME_WEBHOOK").ok(),
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(30));
        assert_eq!(cfg.full_sync_interval, Duration::from_secs(300));
        assert_eq!(cfg.health_check_interval, Duration::from_secs(60));
        assert!(cfg.backoff_floor < cfg.backoff_ceiling);
        assert_eq!(cfg.fetch_chunk_size, 200);
    }

    #[test]
    fn env_secs_falls_back_on_garbage() {
        // Key that is never set in the test environment.
        let d = env_secs("MAILROOM_TEST_UNSET_KEY", Duration::from_secs(7));
        assert_eq!(d, Duration::from_secs(7));
    }
}
