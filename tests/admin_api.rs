//! Integration tests for the admin HTTP surface.
//!
//! Each test binds the Axum router on a random port and exercises the real
//! HTTP contract with reqwest.

use std::sync::Arc;

use tokio::net::TcpListener;
use uuid::Uuid;

use mailroom::api::admin_routes;
use mailroom::config::IngestConfig;
use mailroom::fleet::FleetManager;
use mailroom::notify::{LoggingAutomation, NoopPublisher};
use mailroom::pipeline::{IngestPipeline, ParseLimits};
use mailroom::storage::LocalFsStorage;
use mailroom::store::{LibSqlStore, MetadataStore};

async fn start_server() -> (u16, Arc<FleetManager>) {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store) as Arc<dyn MetadataStore>,
        Arc::new(LocalFsStorage::new(tempfile::tempdir().unwrap().keep())),
        Arc::new(NoopPublisher),
        Arc::new(LoggingAutomation),
        ParseLimits {
            max_headers: 100,
            max_header_value_len: 2048,
            max_attachment_bytes: 10 * 1024 * 1024,
        },
    ));
    let manager = FleetManager::new(store as Arc<dyn MetadataStore>, pipeline, IngestConfig::default());

    let app = admin_routes(Arc::clone(&manager));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (port, manager)
}

#[tokio::test]
async fn health_reports_ok() {
    let (port, manager) = start_server().await;

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "mailroom");
    manager.stop().await;
}

#[tokio::test]
async fn status_returns_fleet_snapshot() {
    let (port, manager) = start_server().await;

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(body["started_at"].is_string());
    assert!(body["workers"].as_array().unwrap().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn reconcile_endpoint_triggers_reconcile() {
    let (port, manager) = start_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/reconcile"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    manager.stop().await;
}

#[tokio::test]
async fn sync_unknown_account_is_reported_not_thrown() {
    let (port, manager) = start_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://127.0.0.1:{port}/sync/{}",
            Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"].is_string());
    manager.stop().await;
}

#[tokio::test]
async fn sync_with_invalid_id_is_a_bad_request() {
    let (port, manager) = start_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/sync/not-a-uuid"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    manager.stop().await;
}
