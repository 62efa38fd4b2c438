mod common;

use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;

use common::{build_gateway, envelope, get_json, ingest, post_json, router, test_config, DownQueue, RecordingQueue};
use ingestion_gateway::staging::DrainRequest;

#[tokio::test]
async fn healthz_reports_service_name() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    let (status, body) = get_json(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "service": "ingestion-gateway"}));
}

#[tokio::test]
async fn resubmissions_stage_once_and_report_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    let (status, body) = ingest(&app, &envelope("evt-1", "key-1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "accepted", "eventId": "evt-1"}));

    for attempt in 0..9 {
        // retries may carry a fresh eventId; the original one is reported back
        let (status, body) = ingest(&app, &envelope(&format!("evt-retry-{attempt}"), "key-1")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["eventId"], "evt-1");
        assert_eq!(body["duplicate"], true);
    }

    assert_eq!(gateway.staging.pending_count(), 1);
    let staged = gateway.staging.drain_pending(&DrainRequest::all(100)).unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].envelope.event_id, "evt-1");
}

#[tokio::test]
async fn same_key_in_another_workspace_is_not_a_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    let first = envelope("evt-1", "shared-key");
    let mut second = envelope("evt-2", "shared-key");
    second["workspaceSlug"] = json!("globex");

    assert_eq!(ingest(&app, &first).await.0, StatusCode::ACCEPTED);
    let (status, body) = ingest(&app, &second).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "accepted", "eventId": "evt-2"}));
    assert_eq!(gateway.staging.pending_count(), 2);
}

#[tokio::test]
async fn missing_required_fields_are_rejected_without_staging() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    let cases = [
        ("eventId", "/eventId"),
        ("eventType", "/eventType"),
        ("workspaceSlug", "/workspaceSlug"),
        ("metadata.idempotencyKey", "/metadata/idempotencyKey"),
    ];
    for (name, pointer) in cases {
        let mut body = envelope("evt-1", "key-1");
        *body.pointer_mut(pointer).unwrap() = json!("");
        let (status, resp) = ingest(&app, &body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{name}");
        assert_eq!(
            resp,
            json!({"error": format!("missing required envelope field: {name}")})
        );
    }

    let mut absent = envelope("evt-1", "key-1");
    absent.as_object_mut().unwrap().remove("workspaceSlug");
    assert_eq!(ingest(&app, &absent).await.0, StatusCode::BAD_REQUEST);

    assert_eq!(gateway.staging.pending_count(), 0);
    assert_eq!(gateway.idempotency.len().unwrap(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    for body in ["{not json", "[1,2,3]", "\"just a string\"", ""] {
        let (status, resp) = post_json(&app, "/v1/events/ingest", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
        assert_eq!(resp, json!({"error": "invalid JSON body"}));
    }
    assert_eq!(gateway.staging.pending_count(), 0);
}

#[tokio::test]
async fn oversized_body_is_refused_by_the_http_layer() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.server.max_body_bytes = 512;
    let gateway = build_gateway(cfg, RecordingQueue::new());
    let app = router(&gateway);

    let mut body = envelope("evt-1", "key-1");
    body["payload"]["blob"] = json!("x".repeat(4096));
    let (status, _) = ingest(&app, &body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(gateway.staging.pending_count(), 0);
}

#[tokio::test]
async fn overload_returns_503_until_drained_and_frees_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.staging.high_water_mark = 3;
    let gateway = build_gateway(cfg, Arc::new(DownQueue));
    let app = router(&gateway);

    for i in 0..3 {
        let (status, _) = ingest(&app, &envelope(&format!("evt-{i}"), &format!("key-{i}"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body) = ingest(&app, &envelope("evt-3", "key-3")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("high-water mark"));

    let (_, stats) = get_json(&app, "/v1/staging/stats").await;
    assert_eq!(stats["pending"], 3);
    assert_eq!(stats["highWaterMark"], 3);

    // drain one record below the mark
    let oldest = gateway.staging.drain_pending(&DrainRequest::all(1)).unwrap();
    assert!(gateway.staging.mark_dispatched(oldest[0].sequence_number).unwrap());

    // the refused key was released, so the retry is accepted, not a duplicate
    let (status, body) = ingest(&app, &envelope("evt-3", "key-3")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "accepted", "eventId": "evt-3"}));
}

#[tokio::test]
async fn staging_stats_reflect_dispatch_progress() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = build_gateway(test_config(dir.path()), RecordingQueue::new());
    let app = router(&gateway);

    for i in 0..4 {
        ingest(&app, &envelope(&format!("evt-{i}"), &format!("key-{i}"))).await;
    }
    let first = gateway.staging.drain_pending(&DrainRequest::all(1)).unwrap();
    gateway.staging.mark_dispatched(first[0].sequence_number).unwrap();

    let (status, stats) = get_json(&app, "/v1/staging/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending"], 3);
    assert_eq!(stats["dispatched"], 1);
    assert_eq!(stats["failed"], 0);
    assert_eq!(stats["readOnly"], false);
}
