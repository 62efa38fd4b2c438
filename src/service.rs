//! Wiring: builds the stores, the ingest use case and the dispatcher from a
//! `GatewayConfig`, and runs them with the HTTP server until shutdown.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::ingest_use_case::IngestUseCase;
use crate::app::ports::DownstreamQueue;
use crate::config::{GatewayConfig, IdempotencyBackend};
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherSettings};
use crate::error::{QueueError, StoreError};
use crate::idempotency::{self, IdempotencyStore, MemoryIdempotencyStore, SqliteIdempotencyStore};
use crate::infra::{HttpDownstreamQueue, LogOnlyQueue};
use crate::server::{self, AppState};
use crate::staging::{self, SqliteStagingLog, StagingLog};

pub struct Gateway {
    pub config: GatewayConfig,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub staging: Arc<dyn StagingLog>,
    pub ingest: Arc<IngestUseCase>,
    pub dispatcher: Arc<Dispatcher>,
}

pub struct BackgroundTasks {
    dispatcher: DispatcherHandle,
    sweeper: JoinHandle<()>,
    janitor: JoinHandle<()>,
}

impl BackgroundTasks {
    pub async fn join(self) {
        self.dispatcher.join().await;
        for (name, task) in [("sweeper", self.sweeper), ("janitor", self.janitor)] {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// `HttpDownstreamQueue` when a URL is configured, otherwise log-only.
pub fn downstream_from_config(config: &GatewayConfig) -> Result<Arc<dyn DownstreamQueue>, QueueError> {
    match config.downstream.url.as_deref() {
        Some(url) => {
            let timeout = Duration::from_millis(config.downstream.request_timeout_ms);
            Ok(Arc::new(HttpDownstreamQueue::new(url, timeout)?))
        }
        None => Ok(Arc::new(LogOnlyQueue)),
    }
}

pub fn open_idempotency_store(config: &GatewayConfig) -> Result<Arc<dyn IdempotencyStore>, StoreError> {
    let retention = Duration::from_secs(config.idempotency.retention_secs);
    let store: Arc<dyn IdempotencyStore> = match config.idempotency.backend {
        IdempotencyBackend::Sqlite => Arc::new(SqliteIdempotencyStore::open_at_root(
            &config.storage.data_root,
            retention,
        )?),
        IdempotencyBackend::Memory => Arc::new(MemoryIdempotencyStore::new(retention)),
    };
    Ok(store)
}

pub fn open_staging_log(config: &GatewayConfig) -> Result<Arc<SqliteStagingLog>, StoreError> {
    Ok(Arc::new(SqliteStagingLog::open_at_root(
        &config.storage.data_root,
        Some(config.staging.high_water_mark),
    )?))
}

impl Gateway {
    pub fn build(config: GatewayConfig, queue: Arc<dyn DownstreamQueue>) -> Result<Self, StoreError> {
        let idempotency = open_idempotency_store(&config)?;
        let staging: Arc<dyn StagingLog> = open_staging_log(&config)?;
        Ok(Self::from_parts(config, idempotency, staging, queue))
    }

    pub fn from_parts(
        config: GatewayConfig,
        idempotency: Arc<dyn IdempotencyStore>,
        staging: Arc<dyn StagingLog>,
        queue: Arc<dyn DownstreamQueue>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            staging.clone(),
            queue,
            DispatcherSettings::from(&config.dispatcher),
        ));
        let ingest = Arc::new(
            IngestUseCase::new(
                idempotency.clone(),
                staging.clone(),
                Duration::from_millis(config.staging.append_timeout_ms),
            )
            .with_dispatch_wake(dispatcher.waker()),
        );
        Self {
            config,
            idempotency,
            staging,
            ingest,
            dispatcher,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.ingest.clone(), &self.config.service_name)
    }

    /// Dispatcher pool, idempotency sweeper and compaction janitor.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> BackgroundTasks {
        if self.staging.is_read_only() {
            warn!("staging log is read-only; new events will be refused");
        }
        let dispatcher = self.dispatcher.clone().spawn(shutdown.clone());
        let sweeper = idempotency::spawn_sweeper(
            self.idempotency.clone(),
            Duration::from_secs(self.config.idempotency.sweep_interval_secs.max(1)),
            shutdown.clone(),
        );
        let janitor = staging::spawn_janitor(
            self.staging.clone(),
            Duration::from_secs(self.config.staging.compaction_interval_secs.max(1)),
            Duration::from_secs(self.config.staging.compaction_retention_secs),
            shutdown,
        );
        BackgroundTasks {
            dispatcher,
            sweeper,
            janitor,
        }
    }

    /// Serve until Ctrl-C, then stop accepting, let in-flight dispatch
    /// attempts finish and exit.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.bind_addr()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = self.spawn_background(shutdown_rx);

        info!(
            service = %self.config.service_name,
            data_root = %self.config.storage.data_root.display(),
            idempotency_backend = self.idempotency.backend_name(),
            high_water_mark = self.config.staging.high_water_mark,
            "ingestion gateway starting"
        );

        let signal = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        };
        let served = server::start_server(
            self.app_state(),
            addr,
            self.config.server.max_body_bytes,
            signal,
        )
        .await;

        let _ = shutdown_tx.send(true);
        background.join().await;
        served.context("HTTP server failed")?;
        info!("ingestion gateway stopped");
        Ok(())
    }
}
