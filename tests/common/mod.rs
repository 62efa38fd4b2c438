#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower::ServiceExt;

use ingestion_gateway::app::ports::{DownstreamQueue, EnqueueOutcome};
use ingestion_gateway::config::{GatewayConfig, IdempotencyBackend};
use ingestion_gateway::envelope::Envelope;
use ingestion_gateway::error::QueueError;
use ingestion_gateway::server;
use ingestion_gateway::service::Gateway;

pub fn envelope(event_id: &str, idempotency_key: &str) -> Value {
    json!({
        "eventId": event_id,
        "eventType": "task.created",
        "occurredAt": "2025-03-14T09:26:53Z",
        "source": "project-management",
        "workspaceSlug": "acme",
        "entity": {"type": "task", "id": "task_1"},
        "payload": {"title": "Draft Q2 roadmap"},
        "metadata": {
            "correlationId": format!("corr-{event_id}"),
            "idempotencyKey": idempotency_key
        }
    })
}

/// Config rooted in `dir` with fast dispatcher timings.
pub fn test_config(dir: &Path) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.storage.data_root = dir.to_path_buf();
    cfg.idempotency.backend = IdempotencyBackend::Sqlite;
    cfg.dispatcher.workers = 2;
    cfg.dispatcher.batch_size = 8;
    cfg.dispatcher.poll_interval_ms = 10;
    cfg.dispatcher.enqueue_timeout_ms = 500;
    cfg.dispatcher.backoff.base_ms = 5;
    cfg.dispatcher.backoff.max_ms = 50;
    cfg.dispatcher.backoff.jitter = 0.0;
    cfg.logging.dir = dir.join("logs");
    cfg
}

pub fn build_gateway(cfg: GatewayConfig, queue: Arc<dyn DownstreamQueue>) -> Gateway {
    Gateway::build(cfg, queue).expect("gateway builds")
}

pub fn router(gateway: &Gateway) -> Router {
    server::create_router(gateway.app_state(), gateway.config.server.max_body_bytes)
}

pub fn post_json(
    app: &Router,
    path: &str,
    body: impl Into<Body>,
) -> impl Future<Output = (StatusCode, Value)> + Send {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    send(app.clone(), request)
}

pub fn get_json(app: &Router, path: &str) -> impl Future<Output = (StatusCode, Value)> + Send {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    send(app.clone(), request)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub fn ingest(app: &Router, body: &Value) -> impl Future<Output = (StatusCode, Value)> + Send {
    post_json(app, "/v1/events/ingest", body.to_string())
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Downstream mock: rejects the first `reject_first` calls, then acks.
/// Every call is recorded with its arrival time.
pub struct RecordingQueue {
    reject_first: usize,
    pub calls: Mutex<Vec<(String, Instant)>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Self::rejecting(0)
    }

    pub fn rejecting(reject_first: usize) -> Arc<Self> {
        Arc::new(Self {
            reject_first,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub async fn event_ids(&self) -> Vec<String> {
        self.calls.lock().await.iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl DownstreamQueue for RecordingQueue {
    async fn enqueue(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        let mut calls = self.calls.lock().await;
        calls.push((envelope.event_id.clone(), Instant::now()));
        if calls.len() <= self.reject_first {
            return Ok(EnqueueOutcome::Reject("downstream busy".to_string()));
        }
        Ok(EnqueueOutcome::Ack)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Downstream that refuses everything; keeps records pending.
pub struct DownQueue;

#[async_trait]
impl DownstreamQueue for DownQueue {
    async fn enqueue(&self, _envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        Err(QueueError::Transport("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "down"
    }
}
