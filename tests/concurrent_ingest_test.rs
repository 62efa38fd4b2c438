mod common;

use axum::http::StatusCode;
use std::collections::HashSet;

use common::{build_gateway, envelope, ingest, router, test_config, RecordingQueue};
use ingestion_gateway::config::IdempotencyBackend;
use ingestion_gateway::staging::DrainRequest;

async fn hundred_racers_stage_exactly_once(backend: IdempotencyBackend) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.idempotency.backend = backend;
    let gateway = build_gateway(cfg, RecordingQueue::new());
    let app = router(&gateway);

    let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(100));
    let mut tasks = Vec::new();
    for i in 0..100 {
        let app = app.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            let body = envelope(&format!("evt-{i}"), "same-key");
            barrier.wait().await;
            ingest(&app, &body).await
        }));
    }

    let mut reported = HashSet::new();
    let mut duplicates = 0;
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        reported.insert(body["eventId"].as_str().unwrap().to_string());
        if body["duplicate"] == true {
            duplicates += 1;
        }
    }

    assert_eq!(duplicates, 99);
    assert_eq!(reported.len(), 1, "every caller sees the same original id");
    let staged = gateway.staging.drain_pending(&DrainRequest::all(1000)).unwrap();
    assert_eq!(staged.len(), 1);
    assert!(reported.contains(&staged[0].envelope.event_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_same_key_with_sqlite_index() {
    hundred_racers_stage_exactly_once(IdempotencyBackend::Sqlite).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_same_key_with_memory_index() {
    hundred_racers_stage_exactly_once(IdempotencyBackend::Memory).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_distinct_keys_get_distinct_sequence_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    let mut tasks = Vec::new();
    for i in 0..50 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            ingest(&app, &envelope(&format!("evt-{i}"), &format!("key-{i}"))).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().0, StatusCode::ACCEPTED);
    }

    let staged = gateway.staging.drain_pending(&DrainRequest::all(1000)).unwrap();
    assert_eq!(staged.len(), 50);
    let seqs: Vec<u64> = staged.iter().map(|r| r.sequence_number).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}
