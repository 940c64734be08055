use std::sync::Arc;

use mailroom::api::admin_routes;
use mailroom::config::IngestConfig;
use mailroom::fleet::FleetManager;
use mailroom::notify::{
    AutomationTrigger, LoggingAutomation, NoopPublisher, RealtimePublisher, WebhookConfig,
    WebhookPublisher,
};
use mailroom::pipeline::{IngestPipeline, ParseLimits};
use mailroom::storage::{LocalFsStorage, StorageProvider};
use mailroom::store::{LibSqlStore, MetadataStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = IngestConfig::from_env();

    // Initialize tracing
    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    eprintln!("📬 mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Admin API: http://0.0.0.0:{}", config.http_port);

    // ── Metadata store ───────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILROOM_DB_PATH").unwrap_or_else(|_| "./data/mailroom.db".to_string());
    let store: Arc<dyn MetadataStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Storage provider ─────────────────────────────────────────────────
    let storage_root =
        std::env::var("MAILROOM_STORAGE_ROOT").unwrap_or_else(|_| "./data/blobs".to_string());
    let storage: Arc<dyn StorageProvider> = Arc::new(LocalFsStorage::new(storage_root.clone()));
    eprintln!("   Blob storage: {storage_root}");

    // ── Side-effect collaborators ────────────────────────────────────────
    let publisher: Arc<dyn RealtimePublisher> = match config.realtime_webhook_url.clone() {
        Some(endpoint) => {
            eprintln!("   Realtime webhook: {endpoint}");
            Arc::new(WebhookPublisher::new(WebhookConfig {
                endpoint,
                timeout_secs: 5,
            }))
        }
        None => {
            eprintln!("   Realtime webhook: disabled");
            Arc::new(NoopPublisher)
        }
    };
    let automation: Arc<dyn AutomationTrigger> = Arc::new(LoggingAutomation);

    // ── Pipeline and fleet ───────────────────────────────────────────────
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store),
        storage,
        publisher,
        automation,
        ParseLimits {
            max_headers: config.max_headers,
            max_header_value_len: config.max_header_value_len,
            max_attachment_bytes: config.max_attachment_bytes,
        },
    ));

    let manager = FleetManager::new(store, pipeline, config.clone());
    manager.start().await;

    // ── Admin HTTP surface ───────────────────────────────────────────────
    let app = admin_routes(Arc::clone(&manager));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Admin server exited: {e}");
        }
    });

    // ── Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received; draining fleet");
    manager.stop().await;
    server.abort();

    Ok(())
}
