//! Delivery against a real HTTP collector and a file-backed outbox.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use edge_agent::envelope::{build_envelope, metric_bucket_event};
use edge_agent::error::AgentError;
use edge_agent::model::ClosedBucket;
use edge_agent::sender::{Sender, SenderConfig, SenderError};
use edge_agent::state::RuntimeStatus;
use edge_agent::storage::Outbox;
use edge_agent::transport::{ApiClient, EDGE_TOKEN_HEADER, EVENTS_PATH};

fn fast_config() -> SenderConfig {
    SenderConfig {
        recv_timeout: Duration::from_millis(20),
        flush_interval: Duration::from_millis(20),
        retry_delays: vec![Duration::ZERO; 3],
        max_auth_failures: 2,
        ..SenderConfig::default()
    }
}

fn sender(server: &MockServer, outbox: &Outbox) -> Sender<ApiClient> {
    let client = ApiClient::new(&server.uri(), "edge-secret", Duration::from_secs(2)).unwrap();
    Sender::new(client, outbox.clone(), Arc::new(RuntimeStatus::new()), fast_config())
}

fn bucket(ts_bucket: i64) -> ClosedBucket {
    let mut metrics = BTreeMap::new();
    metrics.insert("people_count_avg".to_string(), 2.5);
    metrics.insert("people_count_max".to_string(), 4.0);
    ClosedBucket {
        ts_bucket,
        count: 12,
        metrics,
    }
}

#[tokio::test]
async fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite:{}?mode=rwc", dir.path().join("outbox.db").display());
    let event = metric_bucket_event("store-1", "cam-1", "agent-1", &bucket(1_704_067_200));
    let receipt = event.receipt();

    // Collector down: the event ends up on disk
    let down = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;
    let outbox = Outbox::new(&db_url).await.unwrap();
    sender(&down, &outbox)
        .deliver_now(event, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outbox.pending_count().await.unwrap(), 1);
    outbox.close().await;

    // New process, collector back
    let up = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EVENTS_PATH))
        .and(header(EDGE_TOKEN_HEADER, "edge-secret"))
        .and(body_partial_json(json!({"receipt_id": receipt})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&up)
        .await;
    let outbox = Outbox::new(&db_url).await.unwrap();
    assert_eq!(outbox.pending_count().await.unwrap(), 1);

    sender(&up, &outbox).flush_outbox().await.unwrap();
    assert_eq!(outbox.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_same_bucket_sent_twice_keeps_receipt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    let mut sender = sender(&server, &outbox);

    let first = metric_bucket_event("store-1", "cam-1", "agent-1", &bucket(60));
    let second = metric_bucket_event("store-1", "cam-1", "agent-1", &bucket(60));
    assert_ne!(first.event_id, second.event_id);

    let cancel = CancellationToken::new();
    sender.deliver_now(first, &cancel).await.unwrap();
    sender.deliver_now(second, &cancel).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let receipts: Vec<Value> = requests
        .iter()
        .map(|r| r.body_json::<Value>().unwrap()["receipt_id"].clone())
        .collect();
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0], receipts[1]);
}

#[tokio::test]
async fn test_outbox_deduplicates_logical_events() {
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    let data = json!({"store_id": "s", "camera_id": "c", "ts": "2024-01-01T00:00:00Z"});
    let mut enriched = data.clone();
    enriched["note"] = json!("retry with extra context");

    let a = build_envelope("edge_metric_bucket", "edge", data, json!({}), 1).with_receipt();
    let b = build_envelope("edge_metric_bucket", "edge", enriched, json!({}), 1).with_receipt();

    assert!(outbox.enqueue(&a).await.unwrap());
    assert!(!outbox.enqueue(&b).await.unwrap());
    assert_eq!(outbox.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rejected_token_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    let mut sender = sender(&server, &outbox);
    let cancel = CancellationToken::new();

    sender
        .deliver_now(metric_bucket_event("s", "c", "a", &bucket(0)), &cancel)
        .await
        .unwrap();
    let err = sender
        .deliver_now(metric_bucket_event("s", "c", "a", &bucket(60)), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SenderError::AuthRejected { status: 403, .. }));
    assert_eq!(AgentError::from(err).exit_code(), 3);
    // Rejected events are kept for a later token fix
    assert_eq!(outbox.pending_count().await.unwrap(), 2);
}

fn sender_with_status(server: &MockServer, outbox: &Outbox, status: Arc<RuntimeStatus>, max_auth_failures: u32) -> Sender<ApiClient> {
    let client = ApiClient::new(&server.uri(), "edge-secret", Duration::from_secs(2)).unwrap();
    let config = SenderConfig {
        max_auth_failures,
        ..fast_config()
    };
    Sender::new(client, outbox.clone(), status, config)
}

#[tokio::test]
async fn test_auth_failures_accumulate_across_flush_and_live_sends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    for ts_bucket in [0, 60] {
        outbox
            .enqueue(&metric_bucket_event("s", "c", "a", &bucket(ts_bucket)))
            .await
            .unwrap();
    }
    let status = Arc::new(RuntimeStatus::new());
    let mut sender = sender_with_status(&server, &outbox, status.clone(), 3);

    // Each flush stops at its first failure and backs that record off
    sender.flush_outbox().await.unwrap();
    assert_eq!(status.snapshot().consecutive_auth_failures, 1);
    sender.flush_outbox().await.unwrap();
    assert_eq!(status.snapshot().consecutive_auth_failures, 2);

    let err = sender
        .deliver_now(metric_bucket_event("s", "c", "a", &bucket(120)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::AuthRejected { status: 401, consecutive: 3 }));
    assert_eq!(outbox.pending_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_flush_path_alone_reaches_auth_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    for ts_bucket in [0, 60] {
        outbox
            .enqueue(&metric_bucket_event("s", "c", "a", &bucket(ts_bucket)))
            .await
            .unwrap();
    }
    let status = Arc::new(RuntimeStatus::new());
    let mut sender = sender_with_status(&server, &outbox, status.clone(), 2);

    sender.flush_outbox().await.unwrap();
    let err = sender.flush_outbox().await.unwrap_err();

    assert!(matches!(err, SenderError::AuthRejected { status: 403, consecutive: 2 }));
    assert_eq!(AgentError::from(err).exit_code(), 3);
    assert_eq!(outbox.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_flush_success_resets_auth_counter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    let outbox = Outbox::new("sqlite::memory:").await.unwrap();
    for ts_bucket in [0, 60, 120] {
        outbox
            .enqueue(&metric_bucket_event("s", "c", "a", &bucket(ts_bucket)))
            .await
            .unwrap();
    }
    let status = Arc::new(RuntimeStatus::new());
    let mut sender = sender_with_status(&server, &outbox, status.clone(), 3);

    sender.flush_outbox().await.unwrap();
    sender.flush_outbox().await.unwrap();
    assert_eq!(status.snapshot().consecutive_auth_failures, 2);

    // Only the third record is due; the first two are backed off
    sender.flush_outbox().await.unwrap();
    let snapshot = status.snapshot();
    assert_eq!(snapshot.consecutive_auth_failures, 0);
    assert_eq!(snapshot.last_send_http_status, Some(201));
    assert_eq!(outbox.pending_count().await.unwrap(), 2);
}
