//! End-to-end pipeline tests against the in-memory metadata store and a
//! temp-dir storage root.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use mailroom::notify::{LoggingAutomation, NoopPublisher};
use mailroom::pipeline::{CandidateOutcome, IngestContext, IngestPipeline, ParseLimits};
use mailroom::storage::LocalFsStorage;
use mailroom::store::models::{DeliveryMode, Domain, DomainPolicy, ExternalMailbox, Mailbox};
use mailroom::store::{InsertOutcome, LibSqlStore, MetadataStore};

fn limits() -> ParseLimits {
    ParseLimits {
        max_headers: 100,
        max_header_value_len: 2048,
        max_attachment_bytes: 10 * 1024 * 1024,
    }
}

struct Fixture {
    store: Arc<LibSqlStore>,
    pipeline: IngestPipeline,
    domain: Domain,
    account_id: Uuid,
}

async fn fixture(policy: DomainPolicy) -> Fixture {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let storage = Arc::new(LocalFsStorage::new(tempfile::tempdir().unwrap().keep()));

    let domain = Domain {
        id: Uuid::new_v4(),
        name: "acme.example".into(),
        policy,
    };
    store.insert_domain(&domain).await.unwrap();

    let account = ExternalMailbox {
        id: Uuid::new_v4(),
        domain_id: domain.id,
        label: "Acme catch-all".into(),
        imap_host: "imap.acme.example".into(),
        imap_port: 993,
        use_tls: true,
        username: "catchall@acme.example".into(),
        password: "pw".into(),
        poll_interval_secs: 60,
        mode: DeliveryMode::CatchAll,
        is_active: true,
        last_synced_uid: 0,
        last_uid_validity: None,
        consecutive_errors: 0,
        last_error: None,
        last_synced_at: None,
    };
    store.insert_external_mailbox(&account).await.unwrap();

    let pipeline = IngestPipeline::new(
        Arc::clone(&store) as Arc<dyn MetadataStore>,
        storage,
        Arc::new(NoopPublisher),
        Arc::new(LoggingAutomation),
        limits(),
    );

    Fixture {
        store,
        pipeline,
        domain,
        account_id: account.id,
    }
}

fn mailbox(domain_id: Uuid, address: &str, active: bool) -> Mailbox {
    Mailbox {
        id: Uuid::new_v4(),
        domain_id,
        address: address.into(),
        user_id: format!("user-{address}"),
        is_active: active,
        is_archived: false,
        last_message_at: None,
        storage_used_bytes: 0,
        storage_file_count: 0,
        storage_quota_bytes: 0,
    }
}

fn ctx(f: &Fixture) -> IngestContext {
    IngestContext {
        account_id: f.account_id,
        domain: f.domain.clone(),
        personal_mailbox_id: None,
    }
}

#[tokio::test]
async fn catch_all_delivers_only_to_active_matching_mailboxes() {
    let f = fixture(DomainPolicy::KnownRecipientsOnly).await;
    let sales = mailbox(f.domain.id, "sales@acme.example", true);
    let old = mailbox(f.domain.id, "old@acme.example", false);
    f.store.insert_mailbox(&sales).await.unwrap();
    f.store.insert_mailbox(&old).await.unwrap();

    let raw = b"From: buyer@example.net\r\n\
To: sales@acme.example, old@acme.example\r\n\
Subject: Quote\r\n\
Message-ID: <quote-9@example.net>\r\n\
\r\n\
Please quote 100 units.\r\n";

    let outcome = f.pipeline.ingest(&ctx(&f), raw, Some(11)).await.unwrap();

    // Only sales@ gets a canonical message; old@ is audited only.
    assert_eq!(outcome.delivered_count(), 1);
    assert!(outcome.candidates.contains(&CandidateOutcome::Delivered {
        mailbox_id: sales.id
    }));
    assert!(
        outcome
            .candidates
            .iter()
            .any(|c| matches!(c, CandidateOutcome::Unmatched { address } if address == "old@acme.example"))
    );

    assert_eq!(
        f.store.count_canonical_messages(sales.id).await.unwrap(),
        1
    );
    assert_eq!(f.store.count_canonical_messages(old.id).await.unwrap(), 0);

    // The audit trail has exactly one record: a re-run reports a duplicate.
    let rerun = f.pipeline.ingest(&ctx(&f), raw, Some(11)).await.unwrap();
    assert!(rerun.audit_duplicate);
    assert_eq!(rerun.delivered_count(), 0);
}

#[tokio::test]
async fn deliver_all_policy_routes_unmatched_to_fallback() {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let storage = Arc::new(LocalFsStorage::new(tempfile::tempdir().unwrap().keep()));

    let fallback = mailbox(Uuid::new_v4(), "inbox@acme.example", true);
    let domain = Domain {
        id: Uuid::new_v4(),
        name: "acme.example".into(),
        policy: DomainPolicy::DeliverAll {
            fallback_mailbox_id: Some(fallback.id),
        },
    };
    store.insert_domain(&domain).await.unwrap();
    let fallback = Mailbox {
        domain_id: domain.id,
        ..fallback
    };
    store.insert_mailbox(&fallback).await.unwrap();

    let pipeline = IngestPipeline::new(
        Arc::clone(&store) as Arc<dyn MetadataStore>,
        storage,
        Arc::new(NoopPublisher),
        Arc::new(LoggingAutomation),
        limits(),
    );
    let ctx = IngestContext {
        account_id: Uuid::new_v4(),
        domain,
        personal_mailbox_id: None,
    };

    let raw = b"From: x@y.z\r\nTo: whoever@acme.example\r\nSubject: s\r\n\
Message-ID: <m1@y.z>\r\n\r\nhi\r\n";
    let outcome = pipeline.ingest(&ctx, raw, Some(1)).await.unwrap();

    assert_eq!(outcome.delivered_count(), 1);
    assert_eq!(
        store.count_canonical_messages(fallback.id).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn watermark_only_advances_forward() {
    let f = fixture(DomainPolicy::KnownRecipientsOnly).await;
    let mb = mailbox(f.domain.id, "sales@acme.example", true);
    f.store.insert_mailbox(&mb).await.unwrap();

    let newer = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let older = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();

    f.store.advance_mailbox_watermark(mb.id, newer).await.unwrap();
    f.store.advance_mailbox_watermark(mb.id, older).await.unwrap();

    let loaded = f.store.get_mailbox(mb.id).await.unwrap().unwrap();
    assert_eq!(loaded.last_message_at, Some(newer));
}

#[tokio::test]
async fn cursor_updates_are_idempotent_and_health_fields_roundtrip() {
    let f = fixture(DomainPolicy::KnownRecipientsOnly).await;

    f.store
        .update_sync_cursor(f.account_id, 120, Some(777))
        .await
        .unwrap();
    // Retried persist (crash between sync and persist) is harmless.
    f.store
        .update_sync_cursor(f.account_id, 120, Some(777))
        .await
        .unwrap();

    let account = f
        .store
        .get_external_mailbox(f.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.last_synced_uid, 120);
    assert_eq!(account.last_uid_validity, Some(777));

    f.store
        .record_sync_error(f.account_id, "connection refused")
        .await
        .unwrap();
    f.store
        .record_sync_error(f.account_id, "connection refused")
        .await
        .unwrap();
    let account = f
        .store
        .get_external_mailbox(f.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.consecutive_errors, 2);
    assert_eq!(account.last_error.as_deref(), Some("connection refused"));

    f.store
        .record_sync_success(f.account_id, Utc::now())
        .await
        .unwrap();
    let account = f
        .store
        .get_external_mailbox(f.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.consecutive_errors, 0);
    assert!(account.last_error.is_none());
    assert!(account.last_synced_at.is_some());
}

#[tokio::test]
async fn audit_insert_conflict_is_a_noop() {
    use mailroom::store::models::InboundAuditRecord;

    let f = fixture(DomainPolicy::KnownRecipientsOnly).await;
    let record = InboundAuditRecord {
        id: Uuid::new_v4(),
        dedup_key: "k1".into(),
        domain_id: f.domain.id,
        from_addr: "a@b.c".into(),
        recipients: vec!["sales@acme.example".into()],
        subject: Some("s".into()),
        received_at: Utc::now(),
    };

    assert_eq!(
        f.store.insert_audit_record(&record).await.unwrap(),
        InsertOutcome::Inserted
    );

    let retry = InboundAuditRecord {
        id: Uuid::new_v4(),
        ..record
    };
    assert_eq!(
        f.store.insert_audit_record(&retry).await.unwrap(),
        InsertOutcome::AlreadyRecorded
    );
}

#[tokio::test]
async fn attachment_rows_and_bodies_are_stored() {
    let f = fixture(DomainPolicy::KnownRecipientsOnly).await;
    let mb = mailbox(f.domain.id, "sales@acme.example", true);
    f.store.insert_mailbox(&mb).await.unwrap();

    let raw = b"From: a@b.c\r\nTo: sales@acme.example\r\nSubject: with attachment\r\n\
Message-ID: <att-1@b.c>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"ZZ\"\r\n\r\n\
--ZZ\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n\
--ZZ\r\nContent-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\r\n%PDF-fake\r\n\
--ZZ--\r\n";

    let outcome = f.pipeline.ingest(&ctx(&f), raw, Some(5)).await.unwrap();
    assert_eq!(outcome.delivered_count(), 1);

    let msg = f
        .store
        .get_canonical_message(&outcome.dedup_key, mb.id)
        .await
        .unwrap()
        .unwrap();
    assert!(msg.body_text_path.is_some());
    assert_eq!(msg.file_count, 2);
    assert!(msg.size_bytes > 0);
    assert!(!msg.truncated);

    let loaded = f.store.get_mailbox(mb.id).await.unwrap().unwrap();
    assert_eq!(loaded.storage_used_bytes, msg.size_bytes);
    assert_eq!(loaded.storage_file_count, 2);
    assert!(loaded.last_message_at.is_some());
}
